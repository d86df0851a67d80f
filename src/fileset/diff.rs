//! Two-pointer diff over path-ordered entry sequences.

use std::iter::Peekable;

use super::index::Entry;

/// One changed path: absent `old` is a creation, absent `new` a deletion,
/// both present a modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub old: Option<Entry>,
    pub new: Option<Entry>,
}

/// Synchronized walk over two resolved, path-ordered entry sequences.
///
/// Paths whose content is identical on both sides are skipped. Both
/// inputs must already be duplicate-resolved and path-ordered; feeding
/// unresolved sequences produces meaningless pairings.
pub struct Differ<A, B>
where
    A: Iterator<Item = Entry>,
    B: Iterator<Item = Entry>,
{
    old: Peekable<A>,
    new: Peekable<B>,
}

impl<A, B> Differ<A, B>
where
    A: Iterator<Item = Entry>,
    B: Iterator<Item = Entry>,
{
    pub fn new(old: A, new: B) -> Self {
        Differ {
            old: old.peekable(),
            new: new.peekable(),
        }
    }
}

impl<A, B> Iterator for Differ<A, B>
where
    A: Iterator<Item = Entry>,
    B: Iterator<Item = Entry>,
{
    type Item = DiffEntry;

    fn next(&mut self) -> Option<DiffEntry> {
        loop {
            match (self.old.peek(), self.new.peek()) {
                (None, None) => return None,
                (Some(_), None) => {
                    return Some(DiffEntry {
                        old: self.old.next(),
                        new: None,
                    })
                }
                (None, Some(_)) => {
                    return Some(DiffEntry {
                        old: None,
                        new: self.new.next(),
                    })
                }
                (Some(o), Some(n)) => {
                    if o.path < n.path {
                        return Some(DiffEntry {
                            old: self.old.next(),
                            new: None,
                        });
                    }
                    if o.path > n.path {
                        return Some(DiffEntry {
                            old: None,
                            new: self.new.next(),
                        });
                    }
                    let same = o.body == n.body;
                    let pair = DiffEntry {
                        old: self.old.next(),
                        new: self.new.next(),
                    };
                    if same {
                        continue;
                    }
                    return Some(pair);
                }
            }
        }
    }
}
