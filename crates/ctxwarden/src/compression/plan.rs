//! Which messages survive a compression pass.
//!
//! Selection is pure: given messages, their token counts, the active mode's
//! protection rules and the verbatim budget, it marks each message kept or
//! dropped. User messages, the first system message and never-compress
//! categories are always kept. Everything else is kept in reverse drop
//! order (least expendable category first, newest first) until the
//! preserved non-user tokens reach the floor `max(preserve_recent, 0.30 × total)`.

use crate::Message;
use crate::context::mode::ModeProfile;

/// Share of total tokens that must survive verbatim as non-user content.
pub const PRESERVATION_FLOOR_FRACTION: f64 = 0.30;

/// Keep/drop decision for one message set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionPlan {
    pub total_tokens: usize,
    pub floor_tokens: usize,
    pub preserved_non_user_tokens: usize,
    keep: Vec<bool>,
}

/// Token floor for `total_tokens` at `preserve_recent`.
pub fn preservation_floor(preserve_recent: usize, total_tokens: usize) -> usize {
    let fractional = (total_tokens as f64 * PRESERVATION_FLOOR_FRACTION).ceil() as usize;
    preserve_recent.max(fractional)
}

impl CompressionPlan {
    /// Plan a pass over `messages` with per-message token `counts`.
    ///
    /// With `absorb_summaries`, earlier summaries are pulled into the dropped
    /// set whenever anything else is dropped, so the next summary replaces
    /// them instead of sitting next to them.
    pub fn build(
        messages: &[Message],
        counts: &[usize],
        profile: &ModeProfile,
        preserve_recent: usize,
        absorb_summaries: bool,
    ) -> Self {
        debug_assert_eq!(messages.len(), counts.len());
        let total_tokens: usize = counts.iter().sum();
        let floor_tokens = preservation_floor(preserve_recent, total_tokens);

        let first_system = messages.iter().position(|m| m.is_system());
        let protected: Vec<bool> = messages
            .iter()
            .enumerate()
            .map(|(i, m)| {
                m.is_user()
                    || Some(i) == first_system
                    || (!m.is_summary() && profile.is_protected(profile.category_of(m)))
            })
            .collect();

        let plan = Self::fill(messages, counts, profile, &protected, floor_tokens, |_| false);
        if !absorb_summaries || plan.is_noop() {
            return Self {
                total_tokens,
                floor_tokens,
                ..plan
            };
        }

        let kept_summary =
            |i: usize| plan.keep[i] && !protected[i] && messages[i].is_summary();
        if !(0..messages.len()).any(kept_summary) {
            return Self {
                total_tokens,
                floor_tokens,
                ..plan
            };
        }

        let absorbed = Self::fill(messages, counts, profile, &protected, floor_tokens, |i| {
            messages[i].is_summary()
        });
        let drops_real_content = absorbed
            .keep
            .iter()
            .zip(messages)
            .any(|(&keep, m)| !keep && !m.is_summary());
        let chosen = if drops_real_content { absorbed } else { plan };
        Self {
            total_tokens,
            floor_tokens,
            ..chosen
        }
    }

    fn fill(
        messages: &[Message],
        counts: &[usize],
        profile: &ModeProfile,
        protected: &[bool],
        floor_tokens: usize,
        excluded: impl Fn(usize) -> bool,
    ) -> Self {
        let mut keep = protected.to_vec();
        let mut preserved: usize = messages
            .iter()
            .zip(counts)
            .zip(protected)
            .filter(|((m, _), p)| **p && !m.is_user())
            .map(|((_, c), _)| *c)
            .sum();

        // Drop order: lowest rank first, then oldest. Keep from the other end.
        let mut eligible: Vec<usize> = (0..messages.len())
            .filter(|&i| !protected[i] && !excluded(i))
            .collect();
        eligible.sort_by_key(|&i| (profile.drop_rank(profile.category_of(&messages[i])), i));

        for &i in eligible.iter().rev() {
            if preserved >= floor_tokens {
                break;
            }
            keep[i] = true;
            preserved += counts[i];
        }

        Self {
            total_tokens: 0,
            floor_tokens,
            preserved_non_user_tokens: preserved,
            keep,
        }
    }

    /// Nothing would be dropped.
    pub fn is_noop(&self) -> bool {
        self.keep.iter().all(|&k| k)
    }

    pub fn is_kept(&self, index: usize) -> bool {
        self.keep.get(index).copied().unwrap_or(true)
    }

    pub fn dropped_count(&self) -> usize {
        self.keep.iter().filter(|&&k| !k).count()
    }

    /// Split into (preserved, dropped), both in input order.
    pub fn split(&self, messages: &[Message]) -> (Vec<Message>, Vec<Message>) {
        let mut preserved = Vec::with_capacity(messages.len());
        let mut dropped = Vec::new();
        for (i, m) in messages.iter().enumerate() {
            if self.is_kept(i) {
                preserved.push(m.clone());
            } else {
                dropped.push(m.clone());
            }
        }
        (preserved, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::SUMMARY_MARKER;
    use crate::context::mode::{ContentCategory, OperationalMode};

    fn counts(n: usize, each: usize) -> Vec<usize> {
        vec![each; n]
    }

    #[test]
    fn floor_is_max_of_budget_and_fraction() {
        assert_eq!(preservation_floor(100, 1000), 300);
        assert_eq!(preservation_floor(500, 1000), 500);
        assert_eq!(preservation_floor(0, 10), 3);
    }

    #[test]
    fn users_and_first_system_always_kept() {
        let profile = OperationalMode::Assistant.profile();
        let msgs = vec![
            Message::system("prompt"),
            Message::user("u1"),
            Message::assistant("a1"),
            Message::system("note"),
            Message::user("u2"),
            Message::assistant("a2"),
        ];
        let plan = CompressionPlan::build(&msgs, &counts(6, 10), &profile, 0, false);
        assert!(plan.is_kept(0));
        assert!(plan.is_kept(1));
        assert!(plan.is_kept(4));
        assert!(!plan.is_kept(2), "oldest assistant message goes first");
        assert!(plan.preserved_non_user_tokens >= plan.floor_tokens);
    }

    #[test]
    fn floor_keeps_newest_first() {
        let profile = OperationalMode::Assistant.profile();
        let msgs: Vec<Message> = (0..10).map(|i| Message::assistant(format!("m{i}"))).collect();
        // total 1000, floor 300 -> newest three kept
        let plan = CompressionPlan::build(&msgs, &counts(10, 100), &profile, 0, false);
        let kept: Vec<usize> = (0..10).filter(|&i| plan.is_kept(i)).collect();
        assert_eq!(kept, vec![7, 8, 9]);
        assert_eq!(plan.dropped_count(), 7);
    }

    #[test]
    fn budget_covering_everything_is_noop() {
        let profile = OperationalMode::Developer.profile();
        let msgs = vec![Message::assistant("a"), Message::assistant("b")];
        let plan = CompressionPlan::build(&msgs, &counts(2, 50), &profile, 100, false);
        assert!(plan.is_noop());
    }

    #[test]
    fn protected_categories_survive_and_count_toward_floor() {
        let profile = OperationalMode::Debugger.profile();
        let msgs = vec![
            Message::tool("thread 'main' panicked at src/main.rs:1"),
            Message::assistant("chatter 1"),
            Message::assistant("chatter 2"),
            Message::assistant("chatter 3"),
        ];
        let plan = CompressionPlan::build(&msgs, &counts(4, 100), &profile, 0, false);
        assert!(plan.is_kept(0));
        // floor 120: the error trace covers 100, one more message crosses it
        assert!(plan.is_kept(3));
        assert!(!plan.is_kept(1));
        assert!(!plan.is_kept(2));
    }

    #[test]
    fn priority_order_drops_tool_output_before_code() {
        let profile = OperationalMode::Developer.profile();
        let msgs = vec![
            Message::assistant("old code").with_category(ContentCategory::Code),
            Message::tool("newer tool output"),
            Message::assistant("newest chatter").with_category(ContentCategory::Discussion),
        ];
        // floor 90 with P=0: keep code first even though it is the oldest
        let plan = CompressionPlan::build(&msgs, &counts(3, 100), &profile, 0, false);
        assert!(plan.is_kept(0));
        assert!(!plan.is_kept(1));
        assert!(!plan.is_kept(2));
    }

    #[test]
    fn kept_summary_is_absorbed_when_other_content_drops() {
        let profile = OperationalMode::Assistant.profile();
        let msgs = vec![
            Message::system("prompt"),
            Message::assistant("old 1"),
            Message::assistant("old 2"),
            Message::system(format!("{SUMMARY_MARKER} prior")),
            Message::assistant("recent"),
        ];
        let c = vec![10, 100, 100, 100, 100];
        let without = CompressionPlan::build(&msgs, &c, &profile, 0, false);
        assert!(without.is_kept(3));

        let with = CompressionPlan::build(&msgs, &c, &profile, 0, true);
        assert!(!with.is_kept(3));
        assert!(with.preserved_non_user_tokens >= with.floor_tokens);
    }

    #[test]
    fn summary_is_not_protected_by_keywords() {
        let profile = OperationalMode::Debugger.profile();
        let msgs = vec![
            Message::system(format!("{SUMMARY_MARKER} fixed the error in parser")),
            Message::system("prompt comes second here"),
            Message::assistant("a"),
            Message::assistant("b"),
        ];
        // first system message is the summary itself, so it stays
        let plan = CompressionPlan::build(&msgs, &counts(4, 100), &profile, 0, true);
        assert!(plan.is_kept(0));
    }
}
