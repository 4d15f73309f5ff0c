//! Branch rebasing over a commit graph.
//!
//! Commits form a DAG through shared parent links; a branch is a head
//! commit plus its ancestry. Rebasing walks both branches to their common
//! ancestor, skips source commits that already appear in the target (same
//! revision tag at the same offset - they were "advanced over"), and
//! re-mints the remaining source commits on top of the new base, threading
//! each new commit's input context through its predecessor's output.
//!
//! Used on reconnect to recompute a long-running local branch's pending
//! ops before the connected submission loop replays them.

use std::rc::Rc;

/// Stable identity of a change across rebases. A rebased commit keeps its
/// revision tag; that is what makes identity skipping possible.
pub type RevisionTag = u64;

#[derive(Debug)]
pub struct GraphCommit<C> {
    pub revision: RevisionTag,
    pub change: C,
    pub parent: Option<Rc<GraphCommit<C>>>,
}

impl<C> GraphCommit<C> {
    pub fn new(
        revision: RevisionTag,
        change: C,
        parent: Option<Rc<GraphCommit<C>>>,
    ) -> Rc<Self> {
        Rc::new(GraphCommit {
            revision,
            change,
            parent,
        })
    }
}

/// The change algebra branch rebasing needs.
pub trait ChangeRebaser<C> {
    /// `change` re-expressed against a context that already contains
    /// `over`.
    fn rebase(&self, change: &C, over: &C) -> C;
    fn invert(&self, change: &C) -> C;
    fn compose(&self, changes: &[C]) -> C;
}

pub struct RebasedCommits<C> {
    /// Every commit of the old source path, matched and re-minted alike.
    pub deleted_source_commits: Vec<Rc<GraphCommit<C>>>,
    /// The new source path from the common ancestor: the target commits
    /// advanced over, then the re-minted commits.
    pub new_source_commits: Vec<Rc<GraphCommit<C>>>,
    /// The commit the remaining source commits were rebased onto.
    pub new_base: Rc<GraphCommit<C>>,
}

pub struct BranchRebaseResult<C> {
    pub new_source_head: Rc<GraphCommit<C>>,
    /// Net change taking the old source head's state to the new head's,
    /// or `None` when nothing changed.
    pub source_change: Option<C>,
    pub commits: RebasedCommits<C>,
}

/// Root-first ancestry of a head, the head included.
fn ancestry<C>(head: &Rc<GraphCommit<C>>) -> Vec<Rc<GraphCommit<C>>> {
    let mut chain = Vec::new();
    let mut current = Some(head.clone());
    while let Some(commit) = current {
        current = commit.parent.clone();
        chain.push(commit);
    }
    chain.reverse();
    chain
}

fn position_of<C>(chain: &[Rc<GraphCommit<C>>], commit: &Rc<GraphCommit<C>>) -> Option<usize> {
    chain.iter().position(|c| Rc::ptr_eq(c, commit))
}

/// Rebase the branch ending at `source_head` onto `target_head`, up to
/// `new_base` (defaults to the target head).
pub fn rebase_branch<C: Clone>(
    rebaser: &dyn ChangeRebaser<C>,
    source_head: &Rc<GraphCommit<C>>,
    target_head: &Rc<GraphCommit<C>>,
    new_base: Option<&Rc<GraphCommit<C>>>,
) -> BranchRebaseResult<C> {
    let anc_source = ancestry(source_head);
    let anc_target = ancestry(target_head);

    let mut shared = 0;
    while shared < anc_source.len()
        && shared < anc_target.len()
        && Rc::ptr_eq(&anc_source[shared], &anc_target[shared])
    {
        shared += 1;
    }
    assert!(shared > 0, "branches must be related");
    let ancestor = anc_source[shared - 1].clone();

    let new_base = new_base.unwrap_or(target_head);
    let new_base_index = position_of(&anc_target, new_base)
        .unwrap_or_else(|| panic!("target commit is not in target branch"));

    // Already a descendant of the new base: nothing to do.
    if position_of(&anc_source, new_base).is_some() {
        return BranchRebaseResult {
            new_source_head: source_head.clone(),
            source_change: None,
            commits: RebasedCommits {
                deleted_source_commits: Vec::new(),
                new_source_commits: Vec::new(),
                new_base: new_base.clone(),
            },
        };
    }

    let source_path = &anc_source[shared..];
    let target_path = &anc_target[shared..];
    let base_count = new_base_index + 1 - shared;

    // Source commits whose revision matches the target commit at the same
    // offset were advanced over; the rebase base moves past them.
    let mut matched = 0;
    while matched < source_path.len()
        && matched < target_path.len()
        && source_path[matched].revision == target_path[matched].revision
    {
        matched += 1;
    }
    let effective_base_count = base_count.max(matched);

    let targets_over: Vec<C> = target_path[matched..effective_base_count]
        .iter()
        .map(|c| c.change.clone())
        .collect();
    let mut over_acc: Option<C> = if targets_over.is_empty() {
        None
    } else {
        Some(rebaser.compose(&targets_over))
    };

    let mut new_head = if effective_base_count == 0 {
        ancestor
    } else {
        target_path[effective_base_count - 1].clone()
    };
    let effective_base = new_head.clone();

    let mut new_commits = Vec::new();
    for commit in &source_path[matched..] {
        let rebased_change = match &over_acc {
            Some(over) => rebaser.rebase(&commit.change, over),
            None => commit.change.clone(),
        };
        let inverse = rebaser.invert(&commit.change);
        over_acc = Some(match over_acc.take() {
            Some(over) => rebaser.compose(&[inverse, over, rebased_change.clone()]),
            None => rebaser.compose(&[inverse, rebased_change.clone()]),
        });
        let rebased = GraphCommit::new(commit.revision, rebased_change, Some(new_head.clone()));
        new_head = rebased.clone();
        new_commits.push(rebased);
    }

    let mut new_source_commits: Vec<Rc<GraphCommit<C>>> =
        target_path[..effective_base_count].to_vec();
    new_source_commits.extend(new_commits);

    BranchRebaseResult {
        new_source_head: new_head,
        source_change: over_acc,
        commits: RebasedCommits {
            deleted_source_commits: source_path.to_vec(),
            new_source_commits,
            new_base: effective_base,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Position-shift changes: each change inserts `len` units at `pos`.
    /// Enough structure to observe rebasing actually transforming content.
    #[derive(Debug, Clone, PartialEq)]
    struct Shift {
        ops: Vec<(i64, i64)>, // (pos, len)
    }

    struct ShiftRebaser;

    impl ChangeRebaser<Shift> for ShiftRebaser {
        fn rebase(&self, change: &Shift, over: &Shift) -> Shift {
            let ops = change
                .ops
                .iter()
                .map(|&(pos, len)| {
                    let mut shifted = pos;
                    for &(over_pos, over_len) in &over.ops {
                        if over_pos <= shifted {
                            shifted += over_len;
                        }
                    }
                    (shifted, len)
                })
                .collect();
            Shift { ops }
        }

        fn invert(&self, change: &Shift) -> Shift {
            Shift {
                ops: change.ops.iter().rev().map(|&(p, l)| (p, -l)).collect(),
            }
        }

        fn compose(&self, changes: &[Shift]) -> Shift {
            Shift {
                ops: changes.iter().flat_map(|c| c.ops.clone()).collect(),
            }
        }
    }

    fn commit(
        revision: RevisionTag,
        pos: i64,
        len: i64,
        parent: Option<&Rc<GraphCommit<Shift>>>,
    ) -> Rc<GraphCommit<Shift>> {
        GraphCommit::new(
            revision,
            Shift {
                ops: vec![(pos, len)],
            },
            parent.cloned(),
        )
    }

    #[test]
    fn identity_matched_commits_are_advanced_over() {
        // ancestor -> t2 -> t3 -> t4 (target)
        // ancestor -> s2 -> s3 -> s5 (source), where s2/s3 carry the same
        // revisions as t2/t3.
        let ancestor = commit(1, 0, 1, None);
        let t2 = commit(2, 0, 10, Some(&ancestor));
        let t3 = commit(3, 0, 10, Some(&t2));
        let t4 = commit(4, 0, 10, Some(&t3));
        let s2 = commit(2, 0, 10, Some(&ancestor));
        let s3 = commit(3, 0, 10, Some(&s2));
        let s5 = commit(5, 100, 1, Some(&s3));

        let result = rebase_branch(&ShiftRebaser, &s5, &t4, Some(&t4));

        let deleted: Vec<RevisionTag> = result
            .commits
            .deleted_source_commits
            .iter()
            .map(|c| c.revision)
            .collect();
        assert_eq!(deleted, vec![2, 3, 5]);

        let new_path: Vec<RevisionTag> = result
            .commits
            .new_source_commits
            .iter()
            .map(|c| c.revision)
            .collect();
        assert_eq!(new_path, vec![2, 3, 4, 5]);

        // The surviving commit was rebased over t4 only, and its new parent
        // is t4 itself.
        let new_head = &result.new_source_head;
        assert_eq!(new_head.revision, 5);
        assert_eq!(new_head.change.ops, vec![(110, 1)]);
        assert!(Rc::ptr_eq(new_head.parent.as_ref().unwrap(), &t4));
        assert!(Rc::ptr_eq(&result.commits.new_base, &t4));
        assert!(result.source_change.is_some());
    }

    #[test]
    fn descendant_of_new_base_is_unchanged() {
        let ancestor = commit(1, 0, 1, None);
        let t2 = commit(2, 0, 5, Some(&ancestor));
        let s3 = commit(3, 9, 1, Some(&t2));

        let result = rebase_branch(&ShiftRebaser, &s3, &t2, Some(&t2));
        assert!(Rc::ptr_eq(&result.new_source_head, &s3));
        assert!(result.source_change.is_none());
        assert!(result.commits.deleted_source_commits.is_empty());
        assert!(result.commits.new_source_commits.is_empty());
    }

    #[test]
    fn plain_rebase_transforms_each_commit() {
        let ancestor = commit(1, 0, 1, None);
        let t2 = commit(2, 0, 10, Some(&ancestor));
        let s3 = commit(3, 5, 1, Some(&ancestor));
        let s4 = commit(4, 6, 1, Some(&s3));

        let result = rebase_branch(&ShiftRebaser, &s4, &t2, None);
        let path: Vec<RevisionTag> = result
            .commits
            .new_source_commits
            .iter()
            .map(|c| c.revision)
            .collect();
        assert_eq!(path, vec![2, 3, 4]);
        // Both source commits shifted right by t2's insert.
        assert_eq!(result.commits.new_source_commits[1].change.ops, vec![(15, 1)]);
        assert_eq!(result.commits.new_source_commits[2].change.ops, vec![(16, 1)]);
    }

    #[test]
    #[should_panic(expected = "branches must be related")]
    fn unrelated_branches_fail() {
        let a = commit(1, 0, 1, None);
        let b = commit(2, 0, 1, None);
        rebase_branch(&ShiftRebaser, &a, &b, None);
    }

    #[test]
    #[should_panic(expected = "target commit is not in target branch")]
    fn new_base_outside_target_fails() {
        let ancestor = commit(1, 0, 1, None);
        let t2 = commit(2, 0, 1, Some(&ancestor));
        let s3 = commit(3, 0, 1, Some(&ancestor));
        let stray = commit(9, 0, 1, Some(&s3));
        rebase_branch(&ShiftRebaser, &s3, &t2, Some(&stray));
    }
}
