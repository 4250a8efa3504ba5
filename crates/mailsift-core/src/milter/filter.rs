//! Callback logic for one milter connection

use super::{reply_text, EomOutcome, Reply};
use crate::error::{MilterError, MilterResult};
use crate::headers::{self, HeaderContext, HeaderMutation};
use crate::metrics::Metrics;
use crate::modules::{CheckContext, ModuleRegistry};
use crate::session::{SaslInfo, SessionHandle, SessionRegistry, Stage, TlsInfo};
use crate::verdict::{panic_message, Aggregator};
use futures::FutureExt;
use mailsift_common::{Action, ConfigHandle, EmailAddress, SessionId};
use mailsift_storage::StoreQueue;
use std::future::Future;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const PROTOCOL_ERROR_REPLY: &str = "Protocol error, please reconnect";
const LOCAL_ERROR_REPLY: &str = "Temporary local problem, try again later";

/// Milter filter: session bookkeeping, recipient gate and verdicts
pub struct Filter {
    config: Arc<ConfigHandle>,
    sessions: Arc<SessionRegistry>,
    modules: Arc<ModuleRegistry>,
    aggregator: Aggregator,
    store: Arc<StoreQueue>,
    metrics: Arc<Metrics>,
}

impl Filter {
    pub fn new(
        config: Arc<ConfigHandle>,
        modules: Arc<ModuleRegistry>,
        store: Arc<StoreQueue>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let max_age = Duration::from_secs(config.current().milter.session_max_age_secs);
        let sessions = Arc::new(SessionRegistry::new(
            max_age,
            modules.clone(),
            store.clone(),
            metrics.clone(),
        ));

        Self {
            aggregator: Aggregator::new(modules.clone(), metrics.clone()),
            config,
            sessions,
            modules,
            store,
            metrics,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Open a session; `None` tells the MTA to try again later
    pub async fn connect(
        &self,
        client_ip: Option<IpAddr>,
        client_port: Option<u16>,
        reverse_dns: Option<String>,
    ) -> Option<SessionId> {
        let config = self.config.current();
        let created = self
            .recover(Stage::Connect, async {
                Ok(self
                    .sessions
                    .create(config, client_ip, client_port, reverse_dns.clone())
                    .await)
            })
            .await;

        match created {
            Ok((id, handle)) => {
                let allow_listed = handle.lock().await.is_allow_listed();
                info!(
                    session = %id,
                    client_ip = ?client_ip,
                    reverse_dns = reverse_dns.as_deref().unwrap_or("unknown"),
                    allow_listed,
                    "Client connected"
                );
                Some(id)
            }
            Err(e) => {
                self.failure_reply(Stage::Connect, None, e).await;
                None
            }
        }
    }

    pub async fn helo(&self, id: Option<SessionId>, helo: String, tls: TlsInfo) -> Reply {
        self.guard(Stage::Helo, id, async {
            let handle = self.session(id, Stage::Helo).await?;
            let mut session = handle.lock().await;
            debug!(session = %session.id(), helo = %helo, tls = tls.version.is_some(), "HELO");
            session.helo(helo, tls)?;
            Ok(Reply::Continue)
        })
        .await
    }

    /// MAIL FROM: `args` holds the sender followed by any ESMTP parameters
    pub async fn env_from(&self, id: Option<SessionId>, args: Vec<String>, sasl: SaslInfo) -> Reply {
        self.guard(Stage::EnvFrom, id, async {
            let handle = self.session(id, Stage::EnvFrom).await?;
            let mut session = handle.lock().await;

            let senders: Vec<&String> = args.iter().filter(|a| a.starts_with('<')).collect();
            if senders.len() != 1 {
                return Err(MilterError::SenderCount(senders.len()));
            }
            let sender = EmailAddress::from_smtp_arg(senders[0]);

            session.record_sasl(sasl);
            let session_id = session.id();
            let message = session.begin_message(sender)?;
            debug!(session = %session_id, message = %message.id(), sender = %message.sender(), "MAIL FROM");
            Ok(Reply::Continue)
        })
        .await
    }

    /// RCPT TO: gate the recipient through the modules before recording it
    pub async fn env_rcpt(&self, id: Option<SessionId>, args: Vec<String>) -> Reply {
        self.guard(Stage::EnvRcpt, id, async {
            let handle = self.session(id, Stage::EnvRcpt).await?;

            let Some(arg) = args.first() else {
                return Ok(Reply::Reject("5.1.3 Bad recipient address syntax".to_string()));
            };
            let recipient = EmailAddress::from_smtp_arg(arg);

            let (session_id, connection) = {
                let mut session = handle.lock().await;
                session.advance(Stage::EnvRcpt)?;
                if session.current_message().is_none() {
                    return Err(MilterError::NoMessage(Stage::EnvRcpt));
                }
                (session.id(), session.info().clone())
            };

            // Modules may do I/O here, so the session stays unlocked
            let verdict = self.modules.recipient_check(&connection, &recipient).await;

            let reply = match verdict.action {
                Action::Permit => Reply::Continue,
                _ if connection.allow_listed => {
                    info!(
                        session = %session_id,
                        recipient = %recipient,
                        computed = %verdict.action,
                        "Allow-listed session, accepting recipient"
                    );
                    Reply::Continue
                }
                Action::Reject => Reply::Reject(verdict.message),
                Action::TempFail | Action::Error => Reply::TempFail(verdict.message),
            };

            if reply == Reply::Continue {
                let mut session = handle.lock().await;
                session
                    .current_message_mut(Stage::EnvRcpt)?
                    .add_recipient(recipient.clone())?;
                debug!(session = %session_id, recipient = %recipient, "RCPT TO accepted");
            } else {
                info!(session = %session_id, recipient = %recipient, reply = ?reply, "RCPT TO refused");
            }

            Ok(reply)
        })
        .await
    }

    pub async fn header(&self, id: Option<SessionId>, key: String, value: String) -> Reply {
        self.guard(Stage::Header, id, async {
            let handle = self.session(id, Stage::Header).await?;
            let mut session = handle.lock().await;
            session.advance(Stage::Header)?;
            session
                .current_message_mut(Stage::Header)?
                .add_header(key, value)?;
            Ok(Reply::Continue)
        })
        .await
    }

    /// End of headers: the queue id and SASL facts are known from here on
    pub async fn eoh(&self, id: Option<SessionId>, queue_id: Option<String>, sasl: SaslInfo) -> Reply {
        self.guard(Stage::Eoh, id, async {
            let handle = self.session(id, Stage::Eoh).await?;
            let mut session = handle.lock().await;
            session.advance(Stage::Eoh)?;
            session.record_sasl(sasl);

            let message = session.current_message_mut(Stage::Eoh)?;
            if let Some(queue_id) = queue_id.filter(|q| !q.is_empty()) {
                message.set_queue_id(queue_id)?;
            }
            Ok(Reply::Continue)
        })
        .await
    }

    pub async fn body(&self, id: Option<SessionId>, chunk: &[u8]) -> Reply {
        self.guard(Stage::Body, id, async {
            let handle = self.session(id, Stage::Body).await?;
            let mut session = handle.lock().await;
            session.advance(Stage::Body)?;
            session.current_message_mut(Stage::Body)?.append_body(chunk)?;
            Ok(Reply::Continue)
        })
        .await
    }

    /// End of message: decide, mutate headers and reply
    pub async fn eom(&self, id: Option<SessionId>, queue_id: Option<String>) -> EomOutcome {
        self.guard(Stage::Eom, id, self.finish_message(id, queue_id))
            .await
    }

    async fn finish_message(
        &self,
        id: Option<SessionId>,
        queue_id: Option<String>,
    ) -> MilterResult<EomOutcome> {
        let started = Instant::now();
        let handle = self.session(id, Stage::Eom).await?;

        let (ctx, config) = {
            let mut session = handle.lock().await;
            session.advance(Stage::Eom)?;
            let config = session.config().clone();

            let message = session.current_message_mut(Stage::Eom)?;
            if let Some(queue_id) = queue_id.filter(|q| !q.is_empty()) {
                if message.queue_id().is_empty() {
                    message.set_queue_id(queue_id)?;
                }
            }
            message.ensure_message_id(&config.server.hostname)?;

            let message = session
                .current_message()
                .cloned()
                .ok_or(MilterError::NoMessage(Stage::Eom))?;
            let ctx = CheckContext {
                connection: Arc::new(session.info().clone()),
                message,
            };
            (ctx, config)
        };

        let session_id = ctx.message.session_id();
        let message_id = ctx.message.id();
        let queue_id = ctx.message.queue_id().to_string();

        let mut verdict = self.aggregator.evaluate(ctx.clone(), &config).await;

        info!(
            session = %session_id,
            queue_id = %queue_id,
            action = %verdict.action,
            reject_score = verdict.reject_score,
            reject_threshold = verdict.reject_threshold,
            tempfail_score = verdict.tempfail_score,
            tempfail_threshold = verdict.tempfail_threshold,
            deciding_module = verdict.deciding_module.as_deref().unwrap_or("-"),
            errors = verdict.error_count(),
            breaker = verdict.breaker_tripped,
            duration_ms = started.elapsed().as_millis() as u64,
            "Message verdict"
        );

        if ctx.connection.allow_listed && verdict.action != Action::Permit {
            info!(
                session = %session_id,
                queue_id = %queue_id,
                computed = %verdict.action,
                "Allow-listed session, overriding verdict to permit"
            );
            verdict.action = Action::Permit;
            verdict.message.clear();
        }
        self.metrics
            .verdicts
            .with_label_values(&[verdict.action.as_str()])
            .inc();

        // Noop mode delivers whatever the verdict, so the headers go out too
        let delivered = verdict.action == Action::Permit || config.milter.noop;
        let mutations = if delivered {
            headers::compose(
                &config.headers,
                &HeaderContext {
                    hostname: &config.server.hostname,
                    spam_flag_threshold: config.scoring.spam_flag_threshold,
                    message: &ctx.message,
                    verdict: &verdict,
                },
            )
        } else {
            Vec::new()
        };
        drop(ctx);

        let record = {
            let mut session = handle.lock().await;
            let message = session.current_message_mut(Stage::Eom)?;
            if message.id() != message_id {
                return Err(MilterError::NoMessage(Stage::Eom));
            }

            let synthesized = message.synthesized_message_id().map(str::to_string);
            for mutation in &mutations {
                match mutation {
                    HeaderMutation::Add { key, value } => {
                        let already_present = key.eq_ignore_ascii_case("Message-Id")
                            && synthesized.as_deref() == Some(value.as_str());
                        if !already_present {
                            message.add_header(key.clone(), value.clone())?;
                        }
                    }
                    HeaderMutation::Delete { key, index } => {
                        message.delete_header(key, *index)?;
                    }
                }
            }

            message.finalize(verdict.clone())?;
            message.to_record()
        };

        self.aggregator.run_callbacks(&verdict, verdict.action);
        self.store.enqueue_message(record);

        if config.milter.noop {
            if verdict.action != Action::Permit {
                info!(
                    session = %session_id,
                    queue_id = %queue_id,
                    action = %verdict.action,
                    "Noop mode, continuing without enforcing verdict"
                );
            }
            return Ok(EomOutcome {
                reply: Reply::Continue,
                mutations,
            });
        }

        let reply = match verdict.action {
            Action::Permit => Reply::Continue,
            Action::Reject => Reply::Reject(reply_text(&verdict.message, &queue_id)),
            Action::TempFail | Action::Error => {
                Reply::TempFail(reply_text(&verdict.message, &queue_id))
            }
        };

        Ok(EomOutcome { reply, mutations })
    }

    /// Abandon the open message; the session may not exist yet
    pub async fn abort(&self, id: Option<SessionId>) -> Reply {
        self.guard(Stage::Abort, id, async {
            let Some(id) = id else {
                return Ok(Reply::Continue);
            };
            if let Some(handle) = self.sessions.find(id).await {
                let mut session = handle.lock().await;
                if let Some(message) = session.abort_message() {
                    debug!(session = %id, message = %message.id(), "Message aborted");
                }
            }
            Ok(Reply::Continue)
        })
        .await
    }

    /// Persist and forget the session
    pub async fn close(&self, id: Option<SessionId>) -> Reply {
        self.guard(Stage::Close, id, async {
            if let Some(id) = id {
                if self.sessions.delete(id).await {
                    debug!(session = %id, "Session closed");
                }
            }
            Ok(Reply::Continue)
        })
        .await
    }

    async fn session(&self, id: Option<SessionId>, stage: Stage) -> MilterResult<SessionHandle> {
        match id {
            Some(id) => self.sessions.get(id, stage).await,
            None => Err(MilterError::NoSession(stage)),
        }
    }

    /// Recovery boundary around one callback
    async fn guard<T, F>(&self, stage: Stage, id: Option<SessionId>, work: F) -> T
    where
        T: From<Reply>,
        F: Future<Output = MilterResult<T>>,
    {
        match self.recover(stage, work).await {
            Ok(value) => value,
            Err(e) => self.failure_reply(stage, id, e).await.into(),
        }
    }

    /// Turn a panic inside `work` into [`MilterError::Panic`]
    async fn recover<T, F>(&self, stage: Stage, work: F) -> MilterResult<T>
    where
        F: Future<Output = MilterResult<T>>,
    {
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                self.metrics.callback_panics.inc();
                let reason = panic_message(panic.as_ref());
                error!(stage = %stage, "Panic in milter callback: {}", reason);
                if self.config.current().milter.propagate_panics {
                    std::panic::resume_unwind(panic);
                }
                Err(MilterError::Panic(reason))
            }
        }
    }

    async fn failure_reply(&self, stage: Stage, id: Option<SessionId>, err: MilterError) -> Reply {
        self.metrics
            .callback_failures
            .with_label_values(&[stage.as_str()])
            .inc();
        if err.is_protocol_violation() {
            self.metrics.protocol_errors.inc();
        }

        let mut allow_listed = false;
        if let Some(id) = id {
            if let Some(handle) = self.sessions.find(id).await {
                let mut session = handle.lock().await;
                if err.is_fatal() {
                    session.fail();
                }
                allow_listed = session.is_allow_listed();
            }
        }

        match id {
            Some(id) => warn!(session = %id, stage = %stage, allow_listed, "Callback failed: {}", err),
            None => warn!(stage = %stage, "Callback failed: {}", err),
        }

        if allow_listed {
            return Reply::Continue;
        }

        match err {
            MilterError::NoSession(_) => Reply::TempFail(PROTOCOL_ERROR_REPLY.to_string()),
            _ => Reply::TempFail(LOCAL_ERROR_REPLY.to_string()),
        }
    }
}
