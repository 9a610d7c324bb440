//! Segment patterns shared by actions (`.`-separated) and resources
//! (`/`-separated).
//!
//! A pattern is compiled once into a list of segments and matched with a
//! small state-set automaton: `Literal` consumes one equal segment, `Single`
//! (`*`) consumes exactly one segment, and `Multi` (`**`) consumes zero or
//! more. The same representation backs specificity ranking and the subset,
//! overlap and intersection tests used by merge and narrowing.

use std::cmp::{Ordering, Reverse};
use std::collections::HashSet;
use std::fmt;

/// One compiled pattern segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Literal(String),
    Single,
    Multi,
}

impl Segment {
    fn parse(raw: &str) -> Segment {
        match raw {
            "*" => Segment::Single,
            "**" => Segment::Multi,
            other => Segment::Literal(other.to_string()),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Segment::Literal(s) => s,
            Segment::Single => "*",
            Segment::Multi => "**",
        }
    }

    // Can a single concrete segment satisfy both?
    fn compatible(&self, other: &Segment) -> bool {
        match (self, other) {
            (Segment::Literal(a), Segment::Literal(b)) => a == b,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    Action,
    Resource,
}

impl PatternKind {
    /// `.` for actions, `/` for resources.
    pub fn separator(self) -> char {
        match self {
            PatternKind::Action => '.',
            PatternKind::Resource => '/',
        }
    }

    fn split(self, s: &str) -> Vec<&str> {
        s.split(self.separator()).filter(|p| !p.is_empty()).collect()
    }
}

/// A compiled action or resource pattern.
///
/// Equality compares the compiled segments, so `/data/` and `data` are equal
/// resource patterns.
#[derive(Debug, Clone)]
pub struct Pattern {
    kind: PatternKind,
    segments: Vec<Segment>,
    text: String,
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.segments == other.segments
    }
}

impl Eq for Pattern {}

impl std::hash::Hash for Pattern {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.segments.hash(state);
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl Pattern {
    /// Compile a `.`-separated action pattern.
    pub fn action(text: &str) -> Pattern {
        Pattern::compile(PatternKind::Action, text)
    }

    /// Compile a `/`-separated resource pattern. Empty segments are ignored.
    pub fn resource(text: &str) -> Pattern {
        Pattern::compile(PatternKind::Resource, text)
    }

    fn compile(kind: PatternKind, text: &str) -> Pattern {
        let segments = collapse(kind.split(text).into_iter().map(Segment::parse).collect());
        Pattern {
            kind,
            segments,
            text: text.to_string(),
        }
    }

    /// Build a pattern from segments, rendering its text canonically.
    pub fn from_segments(kind: PatternKind, segments: Vec<Segment>) -> Pattern {
        let segments = collapse(segments);
        let joined = segments
            .iter()
            .map(Segment::as_str)
            .collect::<Vec<_>>()
            .join(&kind.separator().to_string());
        let text = match kind {
            PatternKind::Action => joined,
            PatternKind::Resource if segments == [Segment::Multi] => joined,
            PatternKind::Resource => format!("/{joined}"),
        };
        Pattern {
            kind,
            segments,
            text,
        }
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// A pattern without wildcards matches exactly one path.
    pub fn is_exact(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Match a concrete action or resource string.
    pub fn matches(&self, target: &str) -> bool {
        self.matches_segments(&self.kind.split(target))
    }

    /// Match an already split target.
    pub fn matches_segments(&self, target: &[&str]) -> bool {
        let n = self.segments.len();
        let mut active = vec![false; n + 1];
        active[0] = true;
        self.close(&mut active);

        for part in target {
            let mut next = vec![false; n + 1];
            for (i, segment) in self.segments.iter().enumerate() {
                if !active[i] {
                    continue;
                }
                match segment {
                    Segment::Multi => next[i] = true,
                    Segment::Single => next[i + 1] = true,
                    Segment::Literal(lit) if lit.as_str() == *part => next[i + 1] = true,
                    Segment::Literal(_) => {}
                }
            }
            self.close(&mut next);
            if !next.contains(&true) {
                return false;
            }
            active = next;
        }
        active[n]
    }

    // `**` may match nothing, so reaching it also reaches the next state.
    fn close(&self, states: &mut [bool]) {
        for (i, segment) in self.segments.iter().enumerate() {
            if states[i] && *segment == Segment::Multi {
                states[i + 1] = true;
            }
        }
    }

    /// Whether every string this pattern matches is also matched by `other`.
    ///
    /// Conservative: a `false` answer may be returned for exotic `**`
    /// arrangements that are in fact contained. Runs in time proportional to
    /// the product of the two segment counts.
    pub fn is_subset_of(&self, other: &Pattern) -> bool {
        self.kind == other.kind && subset(&self.segments, &other.segments)
    }

    /// Whether some concrete string is matched by both patterns.
    pub fn overlaps(&self, other: &Pattern) -> bool {
        if self.kind != other.kind {
            return false;
        }
        let (p, q) = (&self.segments, &other.segments);
        let mut seen = HashSet::new();
        let mut stack = vec![(0usize, 0usize)];
        while let Some((i, j)) = stack.pop() {
            if !seen.insert((i, j)) {
                continue;
            }
            if i == p.len() && j == q.len() {
                return true;
            }
            if i < p.len() && p[i] == Segment::Multi {
                stack.push((i + 1, j));
            }
            if j < q.len() && q[j] == Segment::Multi {
                stack.push((i, j + 1));
            }
            if i < p.len() && j < q.len() && p[i].compatible(&q[j]) {
                let ni = if p[i] == Segment::Multi { i } else { i + 1 };
                let nj = if q[j] == Segment::Multi { j } else { j + 1 };
                if (ni, nj) != (i, j) {
                    stack.push((ni, nj));
                }
            }
        }
        false
    }

    /// Patterns whose union is contained in the intersection of `self` and
    /// `other`. Exact for patterns without `**` and for the usual trailing
    /// `**` forms; never broader than the true intersection. At most
    /// `MAX_INTERSECTION_PARTS` patterns are returned.
    pub fn intersect(&self, other: &Pattern) -> Vec<Pattern> {
        if self.kind != other.kind || !self.overlaps(other) {
            return Vec::new();
        }
        if subset(&self.segments, &other.segments) {
            return vec![self.clone()];
        }
        if subset(&other.segments, &self.segments) {
            return vec![other.clone()];
        }
        let mut results: Vec<Vec<Segment>> = Vec::new();
        for candidate in intersect(&self.segments, &other.segments) {
            if !results.contains(&candidate) {
                results.push(candidate);
            }
        }
        let pruned: Vec<Vec<Segment>> = results
            .iter()
            .enumerate()
            .filter(|(i, r)| {
                !results.iter().enumerate().any(|(j, s)| {
                    *i != j && subset(r, s) && (!subset(s, r) || j < *i)
                })
            })
            .map(|(_, r)| r.clone())
            .collect();
        pruned
            .into_iter()
            .map(|segments| {
                if segments == self.segments {
                    self.clone()
                } else if segments == other.segments {
                    other.clone()
                } else {
                    Pattern::from_segments(self.kind, segments)
                }
            })
            .collect()
    }

    fn counts(&self) -> (u32, u32, u32) {
        self.segments.iter().fold((0, 0, 0), |(lit, single, multi), s| match s {
            Segment::Literal(_) => (lit + 1, single, multi),
            Segment::Single => (lit, single + 1, multi),
            Segment::Multi => (lit, single, multi + 1),
        })
    }
}

/// Upper bound on the patterns `Pattern::intersect` returns for one pair.
pub const MAX_INTERSECTION_PARTS: usize = 8;

// `**/**` matches exactly what `**` does.
fn collapse(segments: Vec<Segment>) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
    for segment in segments {
        if segment == Segment::Multi && out.last() == Some(&Segment::Multi) {
            continue;
        }
        out.push(segment);
    }
    out
}

// Containment table over suffix pairs, filled from the end of both patterns.
// `row[j]` holds whether `child[i..]` is within `parent[j..]` for the row `i`
// being computed; `below` holds row `i + 1`.
fn subset(child: &[Segment], parent: &[Segment]) -> bool {
    let (n, m) = (child.len(), parent.len());
    let mut below = vec![false; m + 1];
    below[m] = true;
    for j in (0..m).rev() {
        below[j] = parent[j] == Segment::Multi && below[j + 1];
    }
    for i in (0..n).rev() {
        let mut row = vec![false; m + 1];
        for j in (0..m).rev() {
            row[j] = match (&child[i], &parent[j]) {
                (_, Segment::Multi) => row[j + 1] || below[j],
                (Segment::Multi, _) => false,
                (_, Segment::Single) => below[j + 1],
                (Segment::Single, Segment::Literal(_)) => false,
                (Segment::Literal(a), Segment::Literal(b)) => a == b && below[j + 1],
            };
        }
        below = row;
    }
    below[0]
}

fn prefixed(head: &Segment, tails: &[Vec<Segment>], out: &mut Vec<Vec<Segment>>) {
    for tail in tails {
        if out.len() == MAX_INTERSECTION_PARTS {
            return;
        }
        let mut v = Vec::with_capacity(tail.len() + 1);
        if !(*head == Segment::Multi && tail.first() == Some(&Segment::Multi)) {
            v.push(head.clone());
        }
        v.extend(tail.iter().cloned());
        if !out.contains(&v) {
            out.push(v);
        }
    }
}

fn extend_capped(out: &mut Vec<Vec<Segment>>, more: &[Vec<Segment>]) {
    for v in more {
        if out.len() == MAX_INTERSECTION_PARTS {
            return;
        }
        if !out.contains(v) {
            out.push(v.clone());
        }
    }
}

// Intersections of every suffix pair, filled from the end of both patterns
// so each cell reads only cells already computed. Cell order matches a
// left-to-right expansion, so `p` intersected with itself yields `p` first.
fn intersect(p: &[Segment], q: &[Segment]) -> Vec<Vec<Segment>> {
    let (n, m) = (p.len(), q.len());
    let width = m + 1;
    let mut table: Vec<Vec<Vec<Segment>>> = vec![Vec::new(); (n + 1) * width];
    let at = |i: usize, j: usize| i * width + j;

    for i in (0..=n).rev() {
        for j in (0..=m).rev() {
            let cell = if i == n || j == m {
                if p[i..].iter().chain(&q[j..]).all(|s| *s == Segment::Multi) {
                    vec![Vec::new()]
                } else {
                    Vec::new()
                }
            } else {
                let mut out = Vec::new();
                match (&p[i], &q[j]) {
                    (Segment::Multi, Segment::Multi) => {
                        prefixed(&Segment::Multi, &table[at(i + 1, j + 1)], &mut out);
                        extend_capped(&mut out, &table[at(i + 1, j)]);
                        extend_capped(&mut out, &table[at(i, j + 1)]);
                    }
                    (Segment::Multi, other) => {
                        extend_capped(&mut out, &table[at(i + 1, j)]);
                        prefixed(other, &table[at(i, j + 1)], &mut out);
                    }
                    (other, Segment::Multi) => {
                        extend_capped(&mut out, &table[at(i, j + 1)]);
                        prefixed(other, &table[at(i + 1, j)], &mut out);
                    }
                    (Segment::Literal(x), Segment::Literal(y)) if x != y => {}
                    (Segment::Literal(_), _) => prefixed(&p[i], &table[at(i + 1, j + 1)], &mut out),
                    (Segment::Single, _) => prefixed(&q[j], &table[at(i + 1, j + 1)], &mut out),
                }
                out
            };
            table[at(i, j)] = cell;
        }
    }
    std::mem::take(&mut table[at(0, 0)])
}

/// Match an action string against a `.`-separated pattern.
pub fn match_action(pattern: &str, action: &str) -> bool {
    Pattern::action(pattern).matches(action)
}

/// Match a resource path against a `/`-separated pattern.
pub fn match_resource(pattern: &str, resource: &str) -> bool {
    Pattern::resource(pattern).matches(resource)
}

/// Rank of an (action, resource) pattern pair; greater is more specific.
///
/// Ordered by a weighted score (literal 2, `*` 1, `**` 0), then by literal
/// count, then by fewer `**`, then by the rendered patterns so that distinct
/// pairs never tie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specificity {
    score: u32,
    literals: u32,
    multi: Reverse<u32>,
    rendered: Reverse<(String, String)>,
}

impl Specificity {
    /// The weighted score alone, without tie-breakers.
    pub fn score(&self) -> u32 {
        self.score
    }
}

impl Ord for Specificity {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.score, self.literals, &self.multi, &self.rendered).cmp(&(
            other.score,
            other.literals,
            &other.multi,
            &other.rendered,
        ))
    }
}

impl PartialOrd for Specificity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Specificity of an (action, resource) pattern pair.
pub fn specificity(action: &Pattern, resource: &Pattern) -> Specificity {
    let (al, asingle, amulti) = action.counts();
    let (rl, rsingle, rmulti) = resource.counts();
    Specificity {
        score: 2 * (al + rl) + asingle + rsingle,
        literals: al + rl,
        multi: Reverse(amulti + rmulti),
        rendered: Reverse((
            Pattern::from_segments(PatternKind::Action, action.segments.clone()).text,
            Pattern::from_segments(PatternKind::Resource, resource.segments.clone()).text,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_resource_wildcards() {
        assert!(match_resource("/data/**", "/data"));
        assert!(match_resource("/data/**", "/data/x"));
        assert!(match_resource("/data/**", "/data/x/y/z"));
        assert!(match_resource("**", "/anything/at/all"));
        assert!(match_resource("**", "/"));
        assert!(match_resource("/data/*", "/data/x"));
        assert!(!match_resource("/data/*", "/data/x/y"));
        assert!(!match_resource("/data/*", "/data"));
        assert!(!match_resource("/data", "/data/x"));
        assert!(match_resource("/data/", "data"));
        assert!(match_resource("/a/**/z", "/a/z"));
        assert!(match_resource("/a/**/z", "/a/b/c/z"));
        assert!(!match_resource("/a/**/z", "/a/b/c"));
    }

    #[test]
    fn test_match_action_wildcards() {
        assert!(match_action("file.*", "file.read"));
        assert!(!match_action("file.*", "file.a.b"));
        assert!(match_action("file.**", "file"));
        assert!(match_action("file.**", "file.read.all"));
        assert!(match_action("**", "anything.here"));
        assert!(match_action("read", "read"));
        assert!(!match_action("read", "read.all"));
    }

    #[test]
    fn test_specificity_ordering() {
        let exact = specificity(&Pattern::action("read"), &Pattern::resource("/data/x"));
        let single = specificity(&Pattern::action("read"), &Pattern::resource("/data/*"));
        let multi = specificity(&Pattern::action("read"), &Pattern::resource("/data/**"));
        let any = specificity(&Pattern::action("**"), &Pattern::resource("**"));
        assert!(exact > single);
        assert!(single > multi);
        assert!(multi > any);
        assert_eq!(any.score(), 0);
    }

    #[test]
    fn test_specificity_is_total() {
        let a = specificity(&Pattern::action("read"), &Pattern::resource("/a"));
        let b = specificity(&Pattern::action("read"), &Pattern::resource("/b"));
        assert_ne!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn test_subset() {
        let r = Pattern::resource;
        assert!(r("/data/x").is_subset_of(&r("/data/*")));
        assert!(r("/data/*").is_subset_of(&r("/data/**")));
        assert!(r("/data/**").is_subset_of(&r("**")));
        assert!(r("/data").is_subset_of(&r("/data/**")));
        assert!(!r("/data/**").is_subset_of(&r("/data/*")));
        assert!(!r("**").is_subset_of(&r("/data/**")));
        assert!(!r("/other").is_subset_of(&r("/data/**")));
        assert!(!Pattern::action("read").is_subset_of(&r("read")));
    }

    #[test]
    fn test_overlaps() {
        let r = Pattern::resource;
        assert!(r("/data/**").overlaps(&r("/data/secret")));
        assert!(r("/a/*/c").overlaps(&r("/a/b/*")));
        assert!(r("/a/**").overlaps(&r("/**/z")));
        assert!(!r("/a/*").overlaps(&r("/b/**")));
        assert!(!r("/a/*").overlaps(&r("/a/b/c")));
    }

    #[test]
    fn test_intersect() {
        let r = Pattern::resource;
        let texts = |ps: Vec<Pattern>| ps.iter().map(|p| p.as_str().to_string()).collect::<Vec<_>>();
        assert_eq!(texts(r("/data/**").intersect(&r("/data/users/*"))), vec!["/data/users/*"]);
        assert_eq!(texts(r("/a/*/c").intersect(&r("/a/b/*"))), vec!["/a/b/c"]);
        assert_eq!(texts(r("/data/**").intersect(&r("/data/**"))), vec!["/data/**"]);
        assert!(r("/a/*").intersect(&r("/b/*")).is_empty());
        assert_eq!(texts(r("**").intersect(&r("**"))), vec!["**"]);
    }

    #[test]
    fn test_repeated_double_wildcards_collapse() {
        let r = Pattern::resource;
        assert_eq!(r("/a/**/**/b"), r("/a/**/b"));
        assert_eq!(r("/a/**/**/b").segments().len(), 3);
        assert_eq!(r("/a/**/**/b").as_str(), "/a/**/**/b");
    }

    #[test]
    fn test_many_double_wildcards_stay_fast() {
        let chain = |k: usize, last: &str| format!("{}/{last}", "/**/m".repeat(k));
        let (x, y) = (Pattern::resource(&chain(30, "x")), Pattern::resource(&chain(30, "y")));
        assert!(!x.is_subset_of(&y));
        assert!(x.is_subset_of(&Pattern::resource(&chain(29, "**"))));
        assert!(x.intersect(&y).is_empty());

        let open = Pattern::resource(&format!("/m{}", chain(29, "**")));
        let parts = x.intersect(&open);
        assert!(parts.len() <= MAX_INTERSECTION_PARTS);
        let samples = [
            format!("{}/x", "/m".repeat(30)),
            format!("{}/x", "/m/q".repeat(30)),
            format!("/q{}/x", "/m".repeat(30)),
            "/m/x".to_string(),
        ];
        for part in &parts {
            for sample in &samples {
                if part.matches(sample) {
                    assert!(x.matches(sample) && open.matches(sample), "{part} matches {sample}");
                }
            }
        }
    }

    #[test]
    fn test_intersection_is_contained_in_both() {
        let pairs = [("/a/**", "/**/z"), ("/x/*/**", "/x/**/y"), ("**", "/p/*")];
        for (a, b) in pairs {
            let (pa, pb) = (Pattern::resource(a), Pattern::resource(b));
            for i in pa.intersect(&pb) {
                assert!(i.is_subset_of(&pa), "{i} not within {a}");
                assert!(i.is_subset_of(&pb), "{i} not within {b}");
            }
        }
    }
}
