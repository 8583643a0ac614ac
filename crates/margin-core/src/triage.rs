use crate::comment::Comment;
use crate::state::ProcessedState;

/// What the poller should do with one comment. Variants are checked in declaration order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Triage {
    /// Already recorded for this document; nothing to do.
    AlreadyProcessed,
    /// Resolved in the service; record it without replying.
    Solved,
    /// Carries a reply from the agent identity, e.g. from a cycle that crashed before
    /// saving state; record it without replying.
    AlreadyReplied,
    /// Needs a reply.
    Pending,
}

impl Triage {
    pub fn records_without_reply(self) -> bool {
        matches!(self, Triage::Solved | Triage::AlreadyReplied)
    }
}

pub fn triage(
    state: &ProcessedState,
    document: &str,
    comment: &Comment,
    agent_user_id: &str,
) -> Triage {
    if state.is_processed(document, &comment.id) {
        return Triage::AlreadyProcessed;
    }
    if comment.is_solved {
        return Triage::Solved;
    }
    if comment.has_reply_from(agent_user_id) {
        return Triage::AlreadyReplied;
    }
    Triage::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comment::{Reply, RichText};

    fn comment(id: &str, solved: bool, reply_authors: &[&str]) -> Comment {
        Comment {
            id: id.to_owned(),
            user_id: "ou_alice".to_owned(),
            created_at: 1,
            updated_at: 1,
            is_solved: solved,
            solver_user_id: solved.then(|| "ou_alice".to_owned()),
            body: RichText::plain("question"),
            quote: None,
            replies: reply_authors
                .iter()
                .enumerate()
                .map(|(i, a)| Reply {
                    id: format!("r{i}"),
                    user_id: (*a).to_owned(),
                    body: RichText::plain("answer"),
                    created_at: 2,
                })
                .collect(),
        }
    }

    #[test]
    fn processed_takes_precedence_over_everything() {
        let mut state = ProcessedState::default();
        state.mark_processed("doc", "c1");
        let c = comment("c1", true, &["ou_bot"]);
        assert_eq!(triage(&state, "doc", &c, "ou_bot"), Triage::AlreadyProcessed);
    }

    #[test]
    fn processed_is_scoped_per_document() {
        let mut state = ProcessedState::default();
        state.mark_processed("other", "c1");
        let c = comment("c1", false, &[]);
        assert_eq!(triage(&state, "doc", &c, "ou_bot"), Triage::Pending);
    }

    #[test]
    fn solved_wins_over_existing_reply() {
        let state = ProcessedState::default();
        let c = comment("c1", true, &["ou_bot"]);
        assert_eq!(triage(&state, "doc", &c, "ou_bot"), Triage::Solved);
        assert!(Triage::Solved.records_without_reply());
    }

    #[test]
    fn own_reply_is_detected() {
        let state = ProcessedState::default();
        let c = comment("c1", false, &["ou_bob", "ou_bot"]);
        assert_eq!(triage(&state, "doc", &c, "ou_bot"), Triage::AlreadyReplied);
    }

    #[test]
    fn replies_from_others_stay_pending() {
        let state = ProcessedState::default();
        let c = comment("c1", false, &["ou_bob"]);
        assert_eq!(triage(&state, "doc", &c, "ou_bot"), Triage::Pending);
        assert!(!Triage::Pending.records_without_reply());
    }
}
