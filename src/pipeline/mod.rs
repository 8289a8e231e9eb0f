//! Rule-driven message processing pipeline.
//!
//! For each unprocessed message in an account:
//! 1. `rules::select_ordered()` picks the enabled rules for the account
//! 2. `conditions::evaluate()` decides which of them match
//! 3. `ActionExecutor::execute()` applies their actions, rate limited and retried
//! 4. The idempotency store records the message so it is never processed twice

pub mod actions;
pub mod conditions;
pub mod processor;
pub mod rules;
pub mod types;

pub use actions::{Action, ActionExecutor};
pub use conditions::{Condition, DateCondition, MatchType, TextCondition, evaluate};
pub use processor::{AccountProcessor, RunSummary};
pub use rules::{Rule, RuleIssue, load_rules, parse_rules, select_ordered, validate_rules};
pub use types::{ActionResult, Flag, Message, ProcessingContext, Uid};
