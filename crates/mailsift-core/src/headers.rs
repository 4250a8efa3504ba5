//! Header mutations applied at end of message

use crate::session::Message;
use crate::verdict::Verdict;
use mailsift_common::config::HeaderTemplate;

/// One header change to send to the MTA.
///
/// Deletions are meant to be applied in order: each index already accounts
/// for the deletions before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderMutation {
    Add { key: String, value: String },
    Delete { key: String, index: usize },
}

/// Values available to header templates
pub struct HeaderContext<'a> {
    pub hostname: &'a str,
    pub spam_flag_threshold: f64,
    pub message: &'a Message,
    pub verdict: &'a Verdict,
}

impl HeaderContext<'_> {
    fn spam_flag(&self) -> &'static str {
        if self.spam_flag_threshold > 0.0 && self.verdict.reject_score >= self.spam_flag_threshold {
            "YES"
        } else {
            "NO"
        }
    }

    fn substitute(&self, template: &str) -> String {
        template
            .replace("%{hostname}", self.hostname)
            .replace("%{rejectScore}", &format!("{:.2}", self.verdict.reject_score))
            .replace("%{spamFlag}", self.spam_flag())
            .replace("%{action}", self.verdict.action.as_str())
    }
}

/// Build the header mutations for a message
pub fn compose(templates: &[HeaderTemplate], ctx: &HeaderContext<'_>) -> Vec<HeaderMutation> {
    let mut mutations = Vec::new();

    for template in templates {
        let base = ctx.substitute(&template.value);

        let values: Vec<String> = if base.contains("%{recipient}") {
            let recipients = ctx.message.recipients();
            if recipients.is_empty() {
                vec![base.replace("%{recipient}", "")]
            } else {
                recipients
                    .iter()
                    .map(|rcpt| base.replace("%{recipient}", &rcpt.to_string()))
                    .collect()
            }
        } else {
            vec![base]
        };

        let values: Vec<String> = values
            .into_iter()
            .filter(|v| !v.trim().is_empty())
            .collect();
        if values.is_empty() {
            continue;
        }

        if template.unique {
            mutations.extend(delete_existing(ctx.message, &template.key));
        }

        mutations.extend(values.into_iter().map(|value| HeaderMutation::Add {
            key: template.key.clone(),
            value,
        }));
    }

    if let Some(message_id) = ctx.message.synthesized_message_id() {
        mutations.push(HeaderMutation::Add {
            key: "Message-Id".to_string(),
            value: message_id.to_string(),
        });
    }

    mutations
}

/// Deletions for every live occurrence of `key`, in order
fn delete_existing(message: &Message, key: &str) -> Vec<HeaderMutation> {
    let mut indices: Vec<usize> = message
        .headers()
        .iter()
        .filter(|h| !h.deleted && h.key.eq_ignore_ascii_case(key))
        .map(|h| h.index)
        .collect();

    let mut deletions = Vec::with_capacity(indices.len());
    while !indices.is_empty() {
        let index = indices.remove(0);
        deletions.push(HeaderMutation::Delete {
            key: key.to_string(),
            index,
        });
        for later in indices.iter_mut().filter(|i| **i > index) {
            *later -= 1;
        }
    }
    deletions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::MessageCheckResult;
    use crate::verdict::decide;
    use mailsift_common::config::ScoringConfig;
    use mailsift_common::Action;
    use mailsift_common::{EmailAddress, SessionId};
    use pretty_assertions::assert_eq;

    fn template(key: &str, value: &str, unique: bool) -> HeaderTemplate {
        HeaderTemplate {
            key: key.to_string(),
            value: value.to_string(),
            unique,
        }
    }

    fn message(recipients: &[&str]) -> Message {
        let mut message = Message::new(SessionId::new(), EmailAddress::new("from", "example.org"));
        for rcpt in recipients {
            message.add_recipient(rcpt.parse().unwrap()).unwrap();
        }
        message
    }

    fn verdict(reject_score: f64) -> Verdict {
        let mut result = MessageCheckResult::new(Action::Reject, reject_score);
        result.module = "spam".to_string();
        decide(
            vec![result],
            &ScoringConfig {
                reject_threshold: 100.0,
                tempfail_threshold: 100.0,
                ..Default::default()
            },
        )
    }

    fn adds(mutations: &[HeaderMutation]) -> Vec<(String, String)> {
        mutations
            .iter()
            .filter_map(|m| match m {
                HeaderMutation::Add { key, value } => Some((key.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_recipient_expands_per_recipient() {
        let msg = message(&["a@example.org", "b@example.org", "c@example.org"]);
        let verdict = verdict(1.0);
        let ctx = HeaderContext {
            hostname: "mx.example.com",
            spam_flag_threshold: 5.0,
            message: &msg,
            verdict: &verdict,
        };

        let mutations = compose(
            &[template("X-Original-To", "%{recipient} via %{hostname}", false)],
            &ctx,
        );

        assert_eq!(
            adds(&mutations),
            vec![
                ("X-Original-To".to_string(), "a@example.org via mx.example.com".to_string()),
                ("X-Original-To".to_string(), "b@example.org via mx.example.com".to_string()),
                ("X-Original-To".to_string(), "c@example.org via mx.example.com".to_string()),
            ]
        );
    }

    #[test]
    fn test_score_and_flag_substitution() {
        let msg = message(&["a@example.org"]);
        let verdict = verdict(6.5);
        let ctx = HeaderContext {
            hostname: "mx.example.com",
            spam_flag_threshold: 5.0,
            message: &msg,
            verdict: &verdict,
        };

        let mutations = compose(
            &[
                template("X-Spam-Score", "%{rejectScore}", false),
                template("X-Spam-Flag", "%{spamFlag}", false),
            ],
            &ctx,
        );

        assert_eq!(
            adds(&mutations),
            vec![
                ("X-Spam-Score".to_string(), "6.50".to_string()),
                ("X-Spam-Flag".to_string(), "YES".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_values_dropped() {
        let msg = message(&[]);
        let verdict = verdict(0.0);
        let ctx = HeaderContext {
            hostname: "mx.example.com",
            spam_flag_threshold: 5.0,
            message: &msg,
            verdict: &verdict,
        };

        let mutations = compose(
            &[
                template("X-Delivered-To", " %{recipient} ", true),
                template("X-Empty", "", false),
            ],
            &ctx,
        );
        assert!(mutations.is_empty());
    }

    #[test]
    fn test_unique_deletes_existing_in_order() {
        let mut msg = message(&["a@example.org"]);
        msg.add_header("X-Spam-Flag", "NO").unwrap();
        msg.add_header("Subject", "hi").unwrap();
        msg.add_header("x-spam-flag", "YES").unwrap();
        msg.add_header("X-Spam-Flag", "maybe").unwrap();
        let verdict = verdict(0.0);
        let ctx = HeaderContext {
            hostname: "mx.example.com",
            spam_flag_threshold: 5.0,
            message: &msg,
            verdict: &verdict,
        };

        let mutations = compose(&[template("X-Spam-Flag", "%{spamFlag}", true)], &ctx);

        assert_eq!(
            mutations,
            vec![
                HeaderMutation::Delete { key: "X-Spam-Flag".to_string(), index: 1 },
                HeaderMutation::Delete { key: "X-Spam-Flag".to_string(), index: 1 },
                HeaderMutation::Delete { key: "X-Spam-Flag".to_string(), index: 1 },
                HeaderMutation::Add { key: "X-Spam-Flag".to_string(), value: "NO".to_string() },
            ]
        );

        // Applying the deletions in order removes every occurrence
        for m in &mutations {
            if let HeaderMutation::Delete { key, index } = m {
                assert!(msg.delete_header(key, *index).unwrap());
            }
        }
        assert_eq!(msg.header("X-Spam-Flag"), None);
    }

    #[test]
    fn test_synthesized_message_id_added() {
        let mut msg = message(&["a@example.org"]);
        msg.set_queue_id("QID1").unwrap();
        msg.ensure_message_id("mx.example.com").unwrap();
        let verdict = verdict(0.0);
        let ctx = HeaderContext {
            hostname: "mx.example.com",
            spam_flag_threshold: 5.0,
            message: &msg,
            verdict: &verdict,
        };

        assert_eq!(
            compose(&[], &ctx),
            vec![HeaderMutation::Add {
                key: "Message-Id".to_string(),
                value: "<QID1@mx.example.com>".to_string(),
            }]
        );
    }
}
