//! Reply-graph resolution for text notes.
//!
//! Events encode threading through "e" tags (`["e", <id>, <relay>, <marker>,
//! <author>]`) with root/reply/mention markers, and "p" tags for mentioned
//! authors. Older events predate markers and use tag position instead:
//! first e-tag is the root, last is the reply target, anything between is a
//! mention. Parsing tries the marker convention first and only falls back to
//! the positional heuristic when no e-tag carries a marker at all.
//!
//! Everything here is pure: no I/O, no suspension. Malformed or missing tags
//! resolve to "no root" / "no reply", never to an error, because any relay
//! query is a partial view and partial data is routine.

use crate::event::Event;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

/// Role a referenced event plays in a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadMarker {
    Root,
    Reply,
    Mention,
}

impl ThreadMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadMarker::Root => "root",
            ThreadMarker::Reply => "reply",
            ThreadMarker::Mention => "mention",
        }
    }
}

impl FromStr for ThreadMarker {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(ThreadMarker::Root),
            "reply" => Ok(ThreadMarker::Reply),
            "mention" => Ok(ThreadMarker::Mention),
            _ => Err(()),
        }
    }
}

/// A reference to another event, with an optional relay hint for fetching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPointer {
    pub event_id: String,
    pub relay_hint: Option<String>,
}

/// Derived threading view of one event. Recomputed on demand; holds ids,
/// not events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadRef {
    /// The thread's root event, when resolvable.
    pub root: Option<EventPointer>,
    /// The immediate parent being replied to, when resolvable.
    pub reply_to: Option<EventPointer>,
    /// Events referenced without being part of the reply chain.
    pub mentions: Vec<EventPointer>,
    /// Public keys from "p" tags.
    pub mentioned_pubkeys: Vec<String>,
}

impl ThreadRef {
    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some() || self.root.is_some()
    }
}

/// One tree in a resolved thread forest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadNode {
    pub event: Event,
    pub children: Vec<ThreadNode>,
}

struct ETag<'a> {
    event_id: &'a str,
    relay_hint: Option<&'a str>,
    marker: Option<ThreadMarker>,
}

fn parse_e_tag(tag: &[String]) -> Option<ETag<'_>> {
    if tag.len() < 2 || tag[0] != "e" || tag[1].is_empty() {
        return None;
    }
    let relay_hint = tag.get(2).map(String::as_str).filter(|s| !s.is_empty());
    let marker = tag
        .get(3)
        .and_then(|s| ThreadMarker::from_str(s).ok());
    Some(ETag {
        event_id: &tag[1],
        relay_hint,
        marker,
    })
}

fn pointer(tag: &ETag<'_>) -> EventPointer {
    EventPointer {
        event_id: tag.event_id.to_string(),
        relay_hint: tag.relay_hint.map(str::to_string),
    }
}

/// Resolve an event's thread references.
///
/// Marker tier: if any e-tag carries a root/reply/mention marker, markers
/// are authoritative. An event with only a root marker is a direct reply to
/// the root; an event with only a reply marker has an unknown root.
///
/// Positional tier (legacy, no markers anywhere): one e-tag serves as both
/// root and reply target; with two or more, the first is root, the last is
/// the reply target, and the middle are mentions.
pub fn parse_thread(event: &Event) -> ThreadRef {
    let e_tags: Vec<ETag<'_>> = event.tags.iter().filter_map(|t| parse_e_tag(t)).collect();

    let mentioned_pubkeys = event
        .tags
        .iter()
        .filter(|t| t.len() >= 2 && t[0] == "p" && !t[1].is_empty())
        .map(|t| t[1].clone())
        .collect();

    let mut resolved = ThreadRef {
        mentioned_pubkeys,
        ..Default::default()
    };

    let has_markers = e_tags.iter().any(|t| t.marker.is_some());

    if has_markers {
        for tag in &e_tags {
            match tag.marker {
                Some(ThreadMarker::Root) if resolved.root.is_none() => {
                    resolved.root = Some(pointer(tag));
                }
                Some(ThreadMarker::Reply) if resolved.reply_to.is_none() => {
                    resolved.reply_to = Some(pointer(tag));
                }
                Some(ThreadMarker::Mention) => resolved.mentions.push(pointer(tag)),
                _ => {}
            }
        }
        // Only a root marker: replying directly to the root.
        if resolved.reply_to.is_none() {
            resolved.reply_to = resolved.root.clone();
        }
    } else {
        match e_tags.len() {
            0 => {}
            1 => {
                resolved.root = Some(pointer(&e_tags[0]));
                resolved.reply_to = Some(pointer(&e_tags[0]));
            }
            n => {
                resolved.root = Some(pointer(&e_tags[0]));
                resolved.reply_to = Some(pointer(&e_tags[n - 1]));
                resolved.mentions = e_tags[1..n - 1].iter().map(pointer).collect();
            }
        }
    }

    resolved
}

/// Group a flat event set into a thread forest.
///
/// Each event attaches under its resolved reply target when that target is
/// present in the set; otherwise it becomes a root of its own (orphan
/// promotion). Self-references and reply cycles cannot make this loop or
/// drop events: cycle members unreachable from any root are promoted in
/// input order. Children are ordered chronologically within each node.
pub fn build_threads(events: &[Event]) -> Vec<ThreadNode> {
    let mut by_id: HashMap<&str, &Event> = HashMap::new();
    let mut order: Vec<&Event> = Vec::new();
    for event in events {
        // First occurrence wins on duplicate ids.
        if !by_id.contains_key(event.id.as_str()) {
            by_id.insert(&event.id, event);
            order.push(event);
        }
    }

    let mut children: HashMap<&str, Vec<&Event>> = HashMap::new();
    let mut roots: Vec<&Event> = Vec::new();
    for &event in &order {
        let parent = parse_thread(event)
            .reply_to
            .filter(|p| p.event_id != event.id && by_id.contains_key(p.event_id.as_str()));
        match parent {
            Some(p) => {
                let parent_event = by_id[p.event_id.as_str()];
                children
                    .entry(&parent_event.id)
                    .or_default()
                    .push(event);
            }
            None => roots.push(event),
        }
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut forest: Vec<ThreadNode> = roots
        .iter()
        .map(|&root| assemble(root, &children, &mut visited))
        .collect();

    // Mutual-reply cycles have no root; promote their members.
    for &event in &order {
        if !visited.contains(event.id.as_str()) {
            forest.push(assemble(event, &children, &mut visited));
        }
    }

    forest
}

fn assemble<'a>(
    event: &'a Event,
    children: &HashMap<&'a str, Vec<&'a Event>>,
    visited: &mut HashSet<&'a str>,
) -> ThreadNode {
    visited.insert(&event.id);

    let mut kids: Vec<&Event> = children
        .get(event.id.as_str())
        .map(|v| {
            v.iter()
                .filter(|c| !visited.contains(c.id.as_str()))
                .copied()
                .collect()
        })
        .unwrap_or_default();
    kids.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    ThreadNode {
        event: event.clone(),
        children: kids
            .into_iter()
            .map(|c| assemble(c, children, visited))
            .collect(),
    }
}

/// Count reply edges from an event to its resolvable root within `events`.
///
/// The walk stops at the first ancestor absent from the set, so an orphaned
/// subtree measures depth relative to its promoted root. Recomputed each
/// call; ancestor availability changes between queries.
pub fn thread_depth(event: &Event, events: &[Event]) -> usize {
    let by_id: HashMap<&str, &Event> = events.iter().map(|e| (e.id.as_str(), e)).collect();

    let mut depth = 0;
    let mut seen: HashSet<&str> = HashSet::new();
    let mut current = event;
    seen.insert(&current.id);

    while let Some(parent) = parse_thread(current).reply_to {
        let Some(&next) = by_id.get(parent.event_id.as_str()) else {
            break;
        };
        if !seen.insert(&next.id) {
            break;
        }
        depth += 1;
        current = next;
    }

    depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KIND_TEXT_NOTE;

    fn note(id: &str, tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "author".to_string(),
            created_at: 1_700_000_000,
            kind: KIND_TEXT_NOTE,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(str::to_string).collect())
                .collect(),
            content: format!("note {id}"),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn marker_from_str() {
        assert_eq!(ThreadMarker::from_str("root"), Ok(ThreadMarker::Root));
        assert_eq!(ThreadMarker::from_str("reply"), Ok(ThreadMarker::Reply));
        assert_eq!(ThreadMarker::from_str("mention"), Ok(ThreadMarker::Mention));
        assert!(ThreadMarker::from_str("other").is_err());
    }

    #[test]
    fn top_level_note_has_no_references() {
        let resolved = parse_thread(&note("a", vec![]));
        assert_eq!(resolved, ThreadRef::default());
        assert!(!resolved.is_reply());
    }

    #[test]
    fn marked_root_and_reply() {
        let event = note(
            "c",
            vec![
                vec!["e", "a", "", "root"],
                vec!["e", "b", "", "reply"],
            ],
        );
        let resolved = parse_thread(&event);
        assert_eq!(resolved.root.as_ref().unwrap().event_id, "a");
        assert_eq!(resolved.reply_to.as_ref().unwrap().event_id, "b");
    }

    #[test]
    fn lone_reply_marker_leaves_root_unknown() {
        let event = note("c", vec![vec!["e", "b", "", "reply"]]);
        let resolved = parse_thread(&event);
        assert!(resolved.root.is_none());
        assert_eq!(resolved.reply_to.as_ref().unwrap().event_id, "b");
    }

    #[test]
    fn lone_root_marker_is_a_direct_reply_to_root() {
        let event = note("b", vec![vec!["e", "a", "wss://relay.example", "root"]]);
        let resolved = parse_thread(&event);
        assert_eq!(resolved.root.as_ref().unwrap().event_id, "a");
        assert_eq!(resolved.reply_to.as_ref().unwrap().event_id, "a");
        assert_eq!(
            resolved.root.as_ref().unwrap().relay_hint.as_deref(),
            Some("wss://relay.example")
        );
    }

    #[test]
    fn marker_tier_collects_mentions() {
        let event = note(
            "d",
            vec![
                vec!["e", "a", "", "root"],
                vec!["e", "m1", "", "mention"],
                vec!["e", "m2", "", "mention"],
                vec!["e", "c", "", "reply"],
            ],
        );
        let resolved = parse_thread(&event);
        assert_eq!(resolved.root.as_ref().unwrap().event_id, "a");
        assert_eq!(resolved.reply_to.as_ref().unwrap().event_id, "c");
        let mentioned: Vec<&str> = resolved.mentions.iter().map(|m| m.event_id.as_str()).collect();
        assert_eq!(mentioned, vec!["m1", "m2"]);
    }

    #[test]
    fn positional_single_tag_is_both_root_and_reply() {
        let event = note("b", vec![vec!["e", "a"]]);
        let resolved = parse_thread(&event);
        assert_eq!(resolved.root.as_ref().unwrap().event_id, "a");
        assert_eq!(resolved.reply_to.as_ref().unwrap().event_id, "a");
    }

    #[test]
    fn positional_first_root_last_reply_middle_mentions() {
        let event = note("d", vec![vec!["e", "a"], vec!["e", "m"], vec!["e", "c"]]);
        let resolved = parse_thread(&event);
        assert_eq!(resolved.root.as_ref().unwrap().event_id, "a");
        assert_eq!(resolved.reply_to.as_ref().unwrap().event_id, "c");
        assert_eq!(resolved.mentions.len(), 1);
        assert_eq!(resolved.mentions[0].event_id, "m");
    }

    #[test]
    fn malformed_tags_resolve_to_nothing() {
        let event = note(
            "x",
            vec![vec!["e"], vec!["e", ""], vec!["p"], vec!["q", "a"]],
        );
        let resolved = parse_thread(&event);
        assert!(resolved.root.is_none());
        assert!(resolved.reply_to.is_none());
        assert!(resolved.mentions.is_empty());
        assert!(resolved.mentioned_pubkeys.is_empty());
    }

    #[test]
    fn p_tags_collected_as_mentioned_pubkeys() {
        let event = note("x", vec![vec!["p", "alice"], vec!["p", "bob"]]);
        let resolved = parse_thread(&event);
        assert_eq!(resolved.mentioned_pubkeys, vec!["alice", "bob"]);
    }

    #[test]
    fn build_threads_nests_replies_under_roots() {
        let a = note("a", vec![]);
        let b = note("b", vec![vec!["e", "a", "", "root"]]);
        let c = note(
            "c",
            vec![vec!["e", "a", "", "root"], vec!["e", "b", "", "reply"]],
        );

        let forest = build_threads(&[a, b, c]);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].event.id, "a");
        assert_eq!(forest[0].children.len(), 1);
        assert_eq!(forest[0].children[0].event.id, "b");
        assert_eq!(forest[0].children[0].children[0].event.id, "c");
    }

    #[test]
    fn orphan_is_promoted_to_root() {
        // C replies to B, B replies to A, A is not in the set.
        let b = note("b", vec![vec!["e", "a", "", "root"]]);
        let c = note(
            "c",
            vec![vec!["e", "a", "", "root"], vec!["e", "b", "", "reply"]],
        );

        let set = [b, c];
        let forest = build_threads(&set);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].event.id, "b");
        assert_eq!(forest[0].children.len(), 1);
        assert_eq!(forest[0].children[0].event.id, "c");

        assert_eq!(thread_depth(&set[1], &set), 1);
        assert_eq!(thread_depth(&set[0], &set), 0);
    }

    #[test]
    fn children_are_chronological() {
        let a = note("a", vec![]);
        let mut late = note("late", vec![vec!["e", "a", "", "root"]]);
        late.created_at = 2_000_000_000;
        let mut early = note("early", vec![vec!["e", "a", "", "root"]]);
        early.created_at = 1_000_000_000;

        let forest = build_threads(&[a, late, early]);
        let ids: Vec<&str> = forest[0]
            .children
            .iter()
            .map(|c| c.event.id.as_str())
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn reply_cycle_does_not_hang_or_drop_events() {
        let a = note("a", vec![vec!["e", "b", "", "reply"]]);
        let b = note("b", vec![vec!["e", "a", "", "reply"]]);

        let set = [a, b];
        let forest = build_threads(&set);
        let mut total = 0;
        fn count(node: &ThreadNode, total: &mut usize) {
            *total += 1;
            for child in &node.children {
                count(child, total);
            }
        }
        for tree in &forest {
            count(tree, &mut total);
        }
        assert_eq!(total, 2);

        // Depth walk terminates on the cycle too.
        assert!(thread_depth(&set[0], &set) <= 1);
    }

    #[test]
    fn self_reference_is_promoted() {
        let a = note("a", vec![vec!["e", "a", "", "reply"]]);
        let set = [a];
        let forest = build_threads(&set);
        assert_eq!(forest.len(), 1);
        assert!(forest[0].children.is_empty());
        assert_eq!(thread_depth(&set[0], &set), 0);
    }

    #[test]
    fn depth_counts_edges_to_available_root() {
        let a = note("a", vec![]);
        let b = note("b", vec![vec!["e", "a", "", "root"]]);
        let c = note(
            "c",
            vec![vec!["e", "a", "", "root"], vec!["e", "b", "", "reply"]],
        );

        let set = [a, b, c];
        assert_eq!(thread_depth(&set[0], &set), 0);
        assert_eq!(thread_depth(&set[1], &set), 1);
        assert_eq!(thread_depth(&set[2], &set), 2);
    }
}
