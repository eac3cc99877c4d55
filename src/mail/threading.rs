//! Reference-based message threading.
//!
//! Builds a forest of reply chains from Message-ID, References and
//! In-Reply-To headers, then falls back to subject grouping for messages
//! with no usable references. The output is an arena of containers; a
//! container may be empty when it only exists as a grouping point.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::Context;
use crate::mail::message::MessageRef;

/// The threading-relevant snapshot of one message. Taken up front so the
/// algorithm itself never touches message state.
#[derive(Debug, Clone)]
pub struct ThreadEntry {
    /// Position in the message list this entry was snapshotted from.
    pub index: usize,
    pub message_id: Option<String>,
    pub references: Vec<String>,
    pub in_reply_to: Option<String>,
    pub subject: String,
    /// Sortable date string, `YYYY-MM-DD HH:MM`.
    pub date: String,
    pub is_new: bool,
}

/// One node in the thread forest. `message` indexes into the entry list;
/// empty containers stand in for messages we only know by reference.
#[derive(Debug, Default)]
pub struct Container {
    pub message: Option<usize>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    subject: Option<SubjectInfo>,
}

#[derive(Debug, Clone)]
struct SubjectInfo {
    normalized: String,
    is_reply: bool,
}

/// The threaded forest: containers in an arena, roots in display order.
pub struct Forest {
    entries: Vec<ThreadEntry>,
    nodes: Vec<Container>,
    roots: Vec<usize>,
    /// Entry indices displaced by a later message reusing their Message-ID.
    /// They appear nowhere in the forest; callers may surface them.
    pub overridden: Vec<usize>,
}

impl Forest {
    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn node(&self, idx: usize) -> &Container {
        &self.nodes[idx]
    }

    pub fn entries(&self) -> &[ThreadEntry] {
        &self.entries
    }

    pub fn entry(&self, idx: usize) -> &ThreadEntry {
        &self.entries[idx]
    }

    /// The original message-list index a container displays, if any.
    pub fn message_index(&self, node: usize) -> Option<usize> {
        self.nodes[node].message.map(|ei| self.entries[ei].index)
    }

    /// Sort every sibling list and the root list. Empty containers sort by
    /// their first child, recursively.
    pub fn sort_by<F>(&mut self, mut cmp: F)
    where
        F: FnMut(&ThreadEntry, &ThreadEntry) -> Ordering,
    {
        let roots = self.roots.clone();
        for &root in &roots {
            sort_subtree(&mut self.nodes, &self.entries, root, &mut cmp);
        }
        let mut roots = std::mem::take(&mut self.roots);
        roots.sort_by(|&a, &b| compare_containers(&self.nodes, &self.entries, a, b, &mut cmp));
        self.roots = roots;
    }

    /// Stable-partition the roots so threads containing an unread message
    /// come last, preserving relative order on both sides.
    pub fn move_new_last(&mut self) {
        let (old, new): (Vec<usize>, Vec<usize>) = self
            .roots
            .iter()
            .copied()
            .partition(|&r| !subtree_has_new(&self.nodes, &self.entries, r));
        self.roots = old;
        self.roots.extend(new);
    }

    /// Whether any message in the subtree is unread.
    pub fn has_new(&self, node: usize) -> bool {
        subtree_has_new(&self.nodes, &self.entries, node)
    }
}

/// Snapshot the headers threading needs from live messages.
pub fn snapshot(ctx: &Context, messages: &[MessageRef]) -> Vec<ThreadEntry> {
    messages
        .iter()
        .enumerate()
        .map(|(index, msg)| {
            let mut msg = msg.borrow_mut();
            let message_id = nonempty(msg.header(ctx, "message-id"));
            let references = msg
                .header(ctx, "references")
                .split_whitespace()
                .map(str::to_string)
                .collect();
            let in_reply_to = nonempty(msg.header(ctx, "in-reply-to"));
            let subject = msg.header(ctx, "subject");
            let date = sort_key_date(&msg.header(ctx, "date"));
            let is_new = msg.is_new();
            ThreadEntry {
                index,
                message_id,
                references,
                in_reply_to,
                subject,
                date,
                is_new,
            }
        })
        .collect()
}

pub fn thread_messages(ctx: &Context, messages: &[MessageRef]) -> Forest {
    thread(snapshot(ctx, messages))
}

/// Build the thread forest from entry snapshots.
pub fn thread(entries: Vec<ThreadEntry>) -> Forest {
    let mut nodes: Vec<Container> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut overridden: Vec<usize> = Vec::new();

    // Pass 1: a container per message, linked along its reference chain.
    for (ei, entry) in entries.iter().enumerate() {
        let own_id = entry.message_id.as_deref().and_then(extract_id);

        let Some(own_id) = own_id else {
            // No usable ID: an isolated root, never linked to anything.
            nodes.push(Container {
                message: Some(ei),
                ..Container::default()
            });
            continue;
        };

        let own = match by_id.get(&own_id) {
            Some(&node) => {
                // ID reuse: the later message takes the container over and
                // the earlier one is set aside.
                if let Some(old) = nodes[node].message {
                    overridden.push(old);
                }
                nodes[node].message = Some(ei);
                node
            }
            None => {
                nodes.push(Container {
                    message: Some(ei),
                    ..Container::default()
                });
                let node = nodes.len() - 1;
                by_id.insert(own_id.clone(), node);
                node
            }
        };

        let mut chain: Vec<String> = entry
            .references
            .iter()
            .filter_map(|r| extract_id(r))
            .collect();
        if let Some(irt) = entry.in_reply_to.as_deref().and_then(extract_id) {
            if chain.last() != Some(&irt) {
                chain.push(irt);
            }
        }

        let mut prev: Option<usize> = None;
        for id in &chain {
            let node = match by_id.get(id) {
                Some(&node) => node,
                None => {
                    nodes.push(Container::default());
                    let node = nodes.len() - 1;
                    by_id.insert(id.clone(), node);
                    node
                }
            };
            if let Some(parent) = prev {
                link(&mut nodes, parent, node);
            }
            prev = Some(node);
        }
        if let Some(last) = prev {
            if last != own {
                link(&mut nodes, last, own);
            }
        }
    }

    // Pass 2: collect roots and prune empty containers.
    let roots: Vec<usize> = (0..nodes.len())
        .filter(|&i| nodes[i].parent.is_none())
        .collect();
    let mut pruned_roots: Vec<usize> = Vec::new();
    for root in roots {
        for node in prune(&mut nodes, root, true) {
            nodes[node].parent = None;
            pruned_roots.push(node);
        }
    }

    // Pass 3: group roots that share a normalized subject.
    let mut by_subject: HashMap<String, usize> = HashMap::new();
    let mut grouped: HashSet<usize> = HashSet::new();
    let mut final_roots: Vec<usize> = Vec::new();
    for root in pruned_roots {
        let info = subject_info(&mut nodes, &entries, root);
        if info.normalized.is_empty() {
            final_roots.push(root);
            continue;
        }
        match by_subject.get(&info.normalized).copied() {
            None => {
                by_subject.insert(info.normalized.clone(), root);
                final_roots.push(root);
            }
            Some(existing) => {
                let existing_info = subject_info(&mut nodes, &entries, existing);
                let merged = merge_roots(&mut nodes, existing, root, &existing_info, &info);
                grouped.insert(merged);
                if merged != existing {
                    by_subject.insert(info.normalized.clone(), merged);
                    if let Some(slot) = final_roots.iter().position(|&r| r == existing) {
                        final_roots[slot] = merged;
                    }
                }
            }
        }
    }

    // Pass 4: an empty subject-group root hands its place to its oldest
    // direct child, unless that child is itself a reply; the other
    // children follow the promoted one.
    for slot in 0..final_roots.len() {
        let root = final_roots[slot];
        if !grouped.contains(&root) || nodes[root].message.is_some() {
            continue;
        }

        let mut oldest: Option<(usize, usize)> = None;
        for &child in &nodes[root].children {
            let Some(ei) = nodes[child].message else {
                continue;
            };
            oldest = match oldest {
                Some((_, best_ei)) if entries[ei].date >= entries[best_ei].date => oldest,
                _ => Some((child, ei)),
            };
        }

        // Only the oldest child qualifies; a reply there keeps the group
        // under its empty root.
        if let Some((promoted, ei)) = oldest {
            let (_, is_reply) = normalize_subject(&entries[ei].subject);
            if is_reply {
                continue;
            }
            let siblings: Vec<usize> = nodes[root]
                .children
                .iter()
                .copied()
                .filter(|&c| c != promoted)
                .collect();
            for &sibling in &siblings {
                nodes[sibling].parent = Some(promoted);
            }
            nodes[promoted].children.extend(siblings);
            nodes[promoted].parent = None;
            nodes[root].children.clear();
            final_roots[slot] = promoted;
        }
    }

    Forest {
        entries,
        nodes,
        roots: final_roots,
        overridden,
    }
}

/// The first angle-bracketed token of a Message-ID-ish header, or the
/// first bare token when no brackets are present.
fn extract_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(start) = raw.find('<') {
        if let Some(len) = raw[start..].find('>') {
            let id = &raw[start + 1..start + len];
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    raw.split_whitespace().next().map(str::to_string)
}

/// Attach `child` under `parent` unless the child already has a parent or
/// the link would close a cycle.
fn link(nodes: &mut [Container], parent: usize, child: usize) {
    if parent == child || nodes[child].parent.is_some() {
        return;
    }
    // Walking up from the prospective parent must never reach the child.
    let mut probe = parent;
    loop {
        if probe == child {
            return;
        }
        match nodes[probe].parent {
            Some(up) => probe = up,
            None => break,
        }
    }
    nodes[child].parent = Some(parent);
    nodes[parent].children.push(child);
}

/// Post-order prune of empty containers. Returns what replaces `idx` in
/// its parent's child list: itself, its spliced-up children, or nothing.
/// Empty roots keep their place only while they hold several children.
fn prune(nodes: &mut Vec<Container>, idx: usize, at_root: bool) -> Vec<usize> {
    let kids = std::mem::take(&mut nodes[idx].children);
    let mut surviving = Vec::new();
    for kid in kids {
        surviving.extend(prune(nodes, kid, false));
    }
    for &kid in &surviving {
        nodes[kid].parent = Some(idx);
    }
    nodes[idx].children = surviving;

    if nodes[idx].message.is_none() {
        if nodes[idx].children.is_empty() {
            return Vec::new();
        }
        if !at_root || nodes[idx].children.len() == 1 {
            return std::mem::take(&mut nodes[idx].children);
        }
    }
    vec![idx]
}

/// A container's normalized subject, memoized. Empty containers borrow
/// their first child's.
fn subject_info(nodes: &mut [Container], entries: &[ThreadEntry], idx: usize) -> SubjectInfo {
    if nodes[idx].subject.is_none() {
        let raw = match nodes[idx].message {
            Some(ei) => entries[ei].subject.clone(),
            None => nodes[idx]
                .children
                .first()
                .and_then(|&first| nodes[first].message)
                .map(|ei| entries[ei].subject.clone())
                .unwrap_or_default(),
        };
        let (normalized, is_reply) = normalize_subject(&raw);
        nodes[idx].subject = Some(SubjectInfo {
            normalized,
            is_reply,
        });
    }
    match &nodes[idx].subject {
        Some(info) => info.clone(),
        None => SubjectInfo {
            normalized: String::new(),
            is_reply: false,
        },
    }
}

/// Merge two roots with the same normalized subject; returns the survivor.
fn merge_roots(
    nodes: &mut Vec<Container>,
    existing: usize,
    incoming: usize,
    existing_info: &SubjectInfo,
    incoming_info: &SubjectInfo,
) -> usize {
    let existing_empty = nodes[existing].message.is_none();
    let incoming_empty = nodes[incoming].message.is_none();

    if existing_empty && incoming_empty {
        let kids = std::mem::take(&mut nodes[incoming].children);
        for &kid in &kids {
            nodes[kid].parent = Some(existing);
        }
        nodes[existing].children.extend(kids);
        existing
    } else if existing_empty {
        adopt(nodes, existing, incoming);
        existing
    } else if incoming_empty {
        adopt(nodes, incoming, existing);
        incoming
    } else if incoming_info.is_reply && !existing_info.is_reply {
        adopt(nodes, existing, incoming);
        existing
    } else if existing_info.is_reply && !incoming_info.is_reply {
        adopt(nodes, incoming, existing);
        incoming
    } else {
        nodes.push(Container::default());
        let holder = nodes.len() - 1;
        adopt(nodes, holder, existing);
        adopt(nodes, holder, incoming);
        holder
    }
}

fn adopt(nodes: &mut [Container], parent: usize, child: usize) {
    nodes[child].parent = Some(parent);
    nodes[parent].children.push(child);
}

/// Strip one reply/forward prefix, if present.
fn strip_reply_prefix(s: &str) -> Option<&str> {
    let lower = s.to_ascii_lowercase();
    if lower.starts_with("re:") {
        return Some(&s[3..]);
    }
    if lower.starts_with("fwd:") {
        return Some(&s[4..]);
    }
    if lower.starts_with("re[") {
        if let Some(close) = s.find(']') {
            if s[3..close].bytes().all(|b| b.is_ascii_digit())
                && s[close + 1..].starts_with(':')
            {
                return Some(&s[close + 2..]);
            }
        }
    }
    None
}

/// Lower-cased subject with every reply/forward prefix removed, plus
/// whether any prefix was removed.
fn normalize_subject(raw: &str) -> (String, bool) {
    let mut s = raw.trim();
    let mut is_reply = false;
    while let Some(rest) = strip_reply_prefix(s) {
        is_reply = true;
        s = rest.trim_start();
    }
    (s.to_lowercase(), is_reply)
}

fn sort_subtree<F>(nodes: &mut [Container], entries: &[ThreadEntry], idx: usize, cmp: &mut F)
where
    F: FnMut(&ThreadEntry, &ThreadEntry) -> Ordering,
{
    let kids = nodes[idx].children.clone();
    for &kid in &kids {
        sort_subtree(nodes, entries, kid, cmp);
    }
    let mut kids = std::mem::take(&mut nodes[idx].children);
    kids.sort_by(|&a, &b| compare_containers(nodes, entries, a, b, cmp));
    nodes[idx].children = kids;
}

fn compare_containers<F>(
    nodes: &[Container],
    entries: &[ThreadEntry],
    a: usize,
    b: usize,
    cmp: &mut F,
) -> Ordering
where
    F: FnMut(&ThreadEntry, &ThreadEntry) -> Ordering,
{
    match (key_entry(nodes, a), key_entry(nodes, b)) {
        (Some(a), Some(b)) => cmp(&entries[a], &entries[b]),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn key_entry(nodes: &[Container], idx: usize) -> Option<usize> {
    match nodes[idx].message {
        Some(ei) => Some(ei),
        None => nodes[idx]
            .children
            .first()
            .and_then(|&first| key_entry(nodes, first)),
    }
}

fn subtree_has_new(nodes: &[Container], entries: &[ThreadEntry], idx: usize) -> bool {
    if nodes[idx].message.is_some_and(|ei| entries[ei].is_new) {
        return true;
    }
    nodes[idx]
        .children
        .iter()
        .any(|&kid| subtree_has_new(nodes, entries, kid))
}

fn nonempty(s: String) -> Option<String> {
    if s.trim().is_empty() { None } else { Some(s) }
}

/// Turn an RFC 2822-ish Date header into a lexicographically sortable
/// `YYYY-MM-DD HH:MM` string. Unparseable dates sort first, keyed by their
/// raw text.
pub fn sort_key_date(raw: &str) -> String {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    let start = usize::from(tokens.first().is_some_and(|t| t.ends_with(',')));

    let parsed = (|| {
        let day: u32 = tokens.get(start)?.parse().ok()?;
        let month = month_number(tokens.get(start + 1)?)?;
        let year: u32 = tokens.get(start + 2)?.parse().ok()?;
        let mut time = tokens.get(start + 3).copied().unwrap_or("0:0").split(':');
        let hour: u32 = time.next()?.parse().ok()?;
        let minute: u32 = time.next().unwrap_or("0").parse().ok()?;
        Some(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}",
            year, month, day, hour, minute
        ))
    })();

    match parsed {
        Some(key) => key,
        None => format!("0000-00-00 {}", raw.trim()),
    }
}

fn month_number(name: &str) -> Option<u32> {
    let month = match name.to_ascii_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: usize, id: Option<&str>, refs: &[&str], subject: &str) -> ThreadEntry {
        ThreadEntry {
            index,
            message_id: id.map(str::to_string),
            references: refs.iter().map(|s| s.to_string()).collect(),
            in_reply_to: None,
            subject: subject.to_string(),
            date: format!("2024-01-{:02} 00:00", index + 1),
            is_new: false,
        }
    }

    fn root_entry_indices(forest: &Forest) -> Vec<Option<usize>> {
        forest
            .roots()
            .iter()
            .map(|&r| forest.node(r).message)
            .collect()
    }

    #[test]
    fn references_link_child_under_parent() {
        let forest = thread(vec![
            entry(0, Some("<a@x>"), &[], "start"),
            entry(1, Some("<b@x>"), &["<a@x>"], "Re: start"),
        ]);

        assert_eq!(forest.roots().len(), 1);
        let root = forest.node(forest.roots()[0]);
        assert_eq!(root.message, Some(0));
        assert_eq!(root.children.len(), 1);
        assert_eq!(forest.node(root.children[0]).message, Some(1));
    }

    #[test]
    fn in_reply_to_links_when_references_are_absent() {
        let mut reply = entry(1, Some("<b@x>"), &[], "Re: start");
        reply.in_reply_to = Some("<a@x>".into());

        let forest = thread(vec![entry(0, Some("<a@x>"), &[], "start"), reply]);
        assert_eq!(forest.roots().len(), 1);
        assert_eq!(forest.node(forest.roots()[0]).children.len(), 1);
    }

    #[test]
    fn missing_referenced_parent_is_pruned_away() {
        let forest = thread(vec![entry(0, Some("<b@x>"), &["<lost@x>"], "orphan")]);

        assert_eq!(forest.roots().len(), 1);
        let root = forest.node(forest.roots()[0]);
        assert_eq!(root.message, Some(0));
        assert!(root.children.is_empty());
        assert!(root.parent.is_none());
    }

    #[test]
    fn empty_root_with_multiple_children_survives() {
        // Two replies to a message we never saw share its placeholder.
        let forest = thread(vec![
            entry(0, Some("<b@x>"), &["<lost@x>"], "alpha"),
            entry(1, Some("<c@x>"), &["<lost@x>"], "beta"),
        ]);

        assert_eq!(forest.roots().len(), 1);
        let root = forest.node(forest.roots()[0]);
        assert_eq!(root.message, None);
        assert_eq!(root.children.len(), 2);
    }

    #[test]
    fn messages_without_ids_stay_isolated() {
        let forest = thread(vec![
            entry(0, None, &["<a@x>"], "one"),
            entry(1, Some("<a@x>"), &[], "two"),
        ]);

        // The id-less message never links, despite its references.
        assert_eq!(forest.roots().len(), 2);
        assert!(forest.roots().iter().all(|&r| forest.node(r).children.is_empty()));
    }

    #[test]
    fn duplicate_id_keeps_latest_and_reports_earlier() {
        let forest = thread(vec![
            entry(0, Some("<dup@x>"), &[], "first"),
            entry(1, Some("<dup@x>"), &[], "second"),
        ]);

        assert_eq!(forest.overridden, vec![0]);
        assert_eq!(forest.roots().len(), 1);
        assert_eq!(forest.node(forest.roots()[0]).message, Some(1));
    }

    #[test]
    fn reference_cycles_do_not_loop() {
        let forest = thread(vec![
            entry(0, Some("<a@x>"), &["<b@x>"], "a"),
            entry(1, Some("<b@x>"), &["<a@x>"], "b"),
        ]);

        // One of the two links must be refused; everything stays reachable.
        assert_eq!(forest.roots().len(), 1);
        let root = forest.node(forest.roots()[0]);
        assert_eq!(root.children.len(), 1);
        let child = forest.node(root.children[0]);
        assert!(child.children.is_empty());
    }

    #[test]
    fn first_parent_wins_over_later_references() {
        let forest = thread(vec![
            entry(0, Some("<a@x>"), &[], "root"),
            entry(1, Some("<b@x>"), &["<a@x>"], "Re: root"),
            // Claims b hangs under a brand-new placeholder; too late.
            entry(2, Some("<c@x>"), &["<other@x>", "<b@x>"], "Re: root"),
        ]);

        assert_eq!(forest.roots().len(), 1);
        let root = forest.node(forest.roots()[0]);
        assert_eq!(root.message, Some(0));
        let b = forest.node(root.children[0]);
        assert_eq!(b.message, Some(1));
        assert_eq!(forest.node(b.children[0]).message, Some(2));
    }

    #[test]
    fn subject_grouping_hangs_reply_under_original() {
        let forest = thread(vec![
            entry(0, Some("<a@x>"), &[], "Meeting notes"),
            entry(1, Some("<b@x>"), &[], "Re: meeting NOTES"),
        ]);

        assert_eq!(forest.roots().len(), 1);
        let root = forest.node(forest.roots()[0]);
        assert_eq!(root.message, Some(0));
        assert_eq!(forest.node(root.children[0]).message, Some(1));
    }

    #[test]
    fn two_non_replies_promote_the_oldest() {
        // Same subject, no references, neither a reply: the older message
        // becomes the root and absorbs the other.
        let forest = thread(vec![
            entry(0, Some("<a@x>"), &[], "build failure"),
            entry(1, Some("<b@x>"), &[], "build failure"),
        ]);

        assert_eq!(forest.roots().len(), 1);
        let root = forest.node(forest.roots()[0]);
        assert_eq!(root.message, Some(0));
        assert_eq!(forest.node(root.children[0]).message, Some(1));
    }

    #[test]
    fn promotion_skips_groups_whose_oldest_child_is_a_reply() {
        // Two replies to a lost message share its placeholder; a younger
        // non-reply with the same subject joins the group. The oldest
        // child is a reply, so the empty root must stay.
        let forest = thread(vec![
            entry(0, Some("<a@x>"), &["<lost@x>"], "Re: topic"),
            entry(1, Some("<b@x>"), &["<lost@x>"], "Re: topic"),
            entry(2, Some("<c@x>"), &[], "topic"),
        ]);

        assert_eq!(forest.roots().len(), 1);
        let root = forest.node(forest.roots()[0]);
        assert_eq!(root.message, None);
        assert_eq!(root.children.len(), 3);
    }

    #[test]
    fn all_reply_group_keeps_its_empty_root() {
        let forest = thread(vec![
            entry(0, Some("<a@x>"), &[], "Re: gone thread"),
            entry(1, Some("<b@x>"), &[], "Re: gone thread"),
        ]);

        assert_eq!(forest.roots().len(), 1);
        let root = forest.node(forest.roots()[0]);
        assert_eq!(root.message, None);
        assert_eq!(root.children.len(), 2);
    }

    #[test]
    fn empty_subjects_are_never_grouped() {
        let forest = thread(vec![
            entry(0, Some("<a@x>"), &[], ""),
            entry(1, Some("<b@x>"), &[], ""),
        ]);
        assert_eq!(forest.roots().len(), 2);
    }

    #[test]
    fn subject_prefixes_are_stripped() {
        assert_eq!(normalize_subject("Re: Hello"), ("hello".into(), true));
        assert_eq!(normalize_subject("Fwd: Re: Hello"), ("hello".into(), true));
        assert_eq!(normalize_subject("Re[2]: Hello"), ("hello".into(), true));
        assert_eq!(normalize_subject("Hello"), ("hello".into(), false));
        assert_eq!(normalize_subject("Remark"), ("remark".into(), false));
    }

    #[test]
    fn message_id_extraction_prefers_brackets() {
        assert_eq!(extract_id("<a@x>"), Some("a@x".into()));
        assert_eq!(extract_id("noise <a@x> trailing"), Some("a@x".into()));
        assert_eq!(extract_id("bare-token other"), Some("bare-token".into()));
        assert_eq!(extract_id("   "), None);
    }

    #[test]
    fn sort_by_orders_roots_and_siblings() {
        let mut forest = thread(vec![
            entry(0, Some("<first@x>"), &[], "zzz"),
            entry(1, Some("<second@x>"), &[], "aaa"),
            entry(2, Some("<r1@x>"), &["<second@x>"], "Re: aaa"),
            entry(3, Some("<r2@x>"), &["<second@x>"], "Re: aaa"),
        ]);

        forest.sort_by(|a, b| a.date.cmp(&b.date));
        let roots = root_entry_indices(&forest);
        assert_eq!(roots, vec![Some(0), Some(1)]);

        forest.sort_by(|a, b| b.date.cmp(&a.date));
        let roots = root_entry_indices(&forest);
        assert_eq!(roots, vec![Some(1), Some(0)]);
        let aaa = forest
            .roots()
            .iter()
            .copied()
            .find(|&r| forest.node(r).message == Some(1))
            .unwrap();
        let kids: Vec<Option<usize>> = forest
            .node(aaa)
            .children
            .iter()
            .map(|&c| forest.node(c).message)
            .collect();
        assert_eq!(kids, vec![Some(3), Some(2)]);
    }

    #[test]
    fn move_new_last_is_a_stable_partition() {
        let mut entries = vec![
            entry(0, Some("<a@x>"), &[], "a"),
            entry(1, Some("<b@x>"), &[], "b"),
            entry(2, Some("<c@x>"), &[], "c"),
        ];
        entries[0].is_new = true;

        let mut forest = thread(entries);
        forest.move_new_last();
        let roots = root_entry_indices(&forest);
        assert_eq!(roots, vec![Some(1), Some(2), Some(0)]);
    }

    #[test]
    fn unread_reply_marks_the_whole_thread() {
        let mut entries = vec![
            entry(0, Some("<a@x>"), &[], "a"),
            entry(1, Some("<b@x>"), &["<a@x>"], "Re: a"),
        ];
        entries[1].is_new = true;

        let forest = thread(entries);
        assert!(forest.has_new(forest.roots()[0]));
    }

    #[test]
    fn threads_parsed_messages_from_disk() {
        use crate::mail::maildir::Maildir;
        use crate::proxy::testing::ScriptedProxy;
        use crate::{Config, Context};

        let tmp = tempfile::tempdir().unwrap();
        for sub in ["new", "cur", "tmp"] {
            std::fs::create_dir_all(tmp.path().join(sub)).unwrap();
        }
        std::fs::write(
            tmp.path().join("cur/a:2,S"),
            "Message-ID: <a@x>\r\n\
             Subject: start\r\n\
             Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n\
             \r\n\
             hi\r\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("cur/b:2,S"),
            "Message-ID: <b@x>\r\n\
             References: <a@x>\r\n\
             Subject: Re: start\r\n\
             Date: Mon, 1 Jan 2024 11:00:00 +0000\r\n\
             \r\n\
             yo\r\n",
        )
        .unwrap();

        let config = Config {
            maildir_root: tmp.path().to_string_lossy().into_owned(),
            convert_charsets: false,
            tmp_dir: tmp.path().to_string_lossy().into_owned(),
            cache_dir: tmp.path().join("cache").to_string_lossy().into_owned(),
            proxy_socket: String::new(),
        };
        let ctx = Context::with_proxy(config, Box::new(ScriptedProxy::new(&[])));

        let dir = Maildir::local(tmp.path().to_string_lossy().into_owned());
        let messages = dir.messages(&ctx);
        assert_eq!(messages.len(), 2);

        let forest = thread_messages(&ctx, &messages);
        assert_eq!(forest.roots().len(), 1);
        let root = forest.roots()[0];
        assert_eq!(forest.message_index(root), Some(0));
        let children = &forest.node(root).children;
        assert_eq!(children.len(), 1);
        assert_eq!(forest.message_index(children[0]), Some(1));

        // The snapshot normalized the Date header into a sortable key.
        let root_entry = forest.node(root).message.unwrap();
        assert_eq!(forest.entry(root_entry).date, "2024-01-01 10:00");
    }

    #[test]
    fn date_sort_keys_are_lexicographic() {
        assert_eq!(
            sort_key_date("Tue, 14 Mar 2023 12:34:56 +0000"),
            "2023-03-14 12:34"
        );
        assert_eq!(sort_key_date("2 Jan 2024 08:05:00 +0100"), "2024-01-02 08:05");
        assert!(sort_key_date("not a date").starts_with("0000-00-00"));
        assert!(sort_key_date("1 Jan 2024 00:00") > sort_key_date("garbage"));
    }
}
