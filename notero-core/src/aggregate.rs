//! Vote aggregation: raw notes and ballots in, annotated notes out.
//!
//! Stateless by construction. Callers pass fresh snapshots on every query.
//! Cost is one pass over ballots plus one over notes.

use std::collections::HashMap;

use crate::model::{AggregatedNote, Ballot, Note};

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    count: usize,
    voted_by_viewer: bool,
}

/// Annotate each note with its vote count and whether `viewer_id` voted.
///
/// Ballots referencing a note that is not in `notes` are ignored.
/// Output follows the order of `notes`.
pub fn aggregate(notes: &[Note], ballots: &[Ballot], viewer_id: &str) -> Vec<AggregatedNote> {
    let mut tallies: HashMap<&str, Tally> = HashMap::with_capacity(notes.len());
    for ballot in ballots {
        let tally = tallies.entry(ballot.note_id.as_str()).or_default();
        tally.count += 1;
        tally.voted_by_viewer |= ballot.user.id == viewer_id;
    }

    notes
        .iter()
        .map(|note| {
            let tally = tallies.get(note.id.as_str()).copied().unwrap_or_default();
            AggregatedNote {
                note: note.clone(),
                vote_count: tally.count,
                voted_by_current_user: tally.voted_by_viewer,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::User;

    fn user(id: &str) -> User {
        User::new(id, id.to_uppercase())
    }

    fn note(id: &str) -> Note {
        Note {
            id: id.into(),
            text: format!("note {id}"),
            author: user("author"),
        }
    }

    #[test]
    fn test_empty_board() {
        assert!(aggregate(&[], &[], "me").is_empty());
    }

    #[test]
    fn test_counts_and_viewer_flag() {
        let notes = vec![note("n1"), note("n2")];
        let ballots = vec![
            Ballot::cast(&notes[0], &user("me")),
            Ballot::cast(&notes[0], &user("you")),
            Ballot::cast(&notes[1], &user("you")),
        ];

        let board = aggregate(&notes, &ballots, "me");

        assert_eq!(board.len(), 2);
        assert_eq!(board[0].vote_count, 2);
        assert!(board[0].voted_by_current_user);
        assert_eq!(board[1].vote_count, 1);
        assert!(!board[1].voted_by_current_user);
    }

    #[test]
    fn test_note_without_ballots_has_zero() {
        let notes = vec![note("n1")];
        let board = aggregate(&notes, &[], "me");
        assert_eq!(board[0].vote_count, 0);
        assert!(!board[0].voted_by_current_user);
    }

    #[test]
    fn test_orphan_ballot_ignored() {
        let notes = vec![note("n1")];
        let orphan = Ballot::cast(&note("deleted"), &user("me"));
        let board = aggregate(&notes, &[orphan], "me");
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].vote_count, 0);
        assert!(!board[0].voted_by_current_user);
    }

    #[test]
    fn test_viewer_flag_depends_on_viewer() {
        let notes = vec![note("n1")];
        let ballots = vec![Ballot::cast(&notes[0], &user("you"))];
        assert!(aggregate(&notes, &ballots, "you")[0].voted_by_current_user);
        assert!(!aggregate(&notes, &ballots, "me")[0].voted_by_current_user);
    }
}
