//! indymilter glue
//!
//! The only place indymilter types appear. Each connection context carries
//! just the [`SessionId`]; everything else lives in the [`Filter`].

use super::{Filter, Reply};
use crate::headers::HeaderMutation;
use crate::session::{SaslInfo, TlsInfo};
use byte_strings::c_str;
use indymilter::{
    Actions, Callbacks, Context, ContextActions, EomContext, MacroStage, Macros,
    NegotiateContext, SetErrorReply, SocketInfo, Status,
};
use mailsift_common::SessionId;
use std::ffi::{CStr, CString};
use std::sync::Arc;
use tracing::warn;

trait MacrosExt {
    fn get_string(&self, name: &CStr) -> Option<String>;
}

impl MacrosExt for Macros {
    fn get_string(&self, name: &CStr) -> Option<String> {
        self.get(name)
            .map(|v| v.to_string_lossy().into_owned())
            .filter(|v| !v.is_empty())
    }
}

/// Build the indymilter callbacks driving `filter`
pub fn make_callbacks(filter: Arc<Filter>) -> Callbacks<SessionId> {
    let on_connect = filter.clone();
    let on_helo = filter.clone();
    let on_mail = filter.clone();
    let on_rcpt = filter.clone();
    let on_header = filter.clone();
    let on_eoh = filter.clone();
    let on_body = filter.clone();
    let on_eom = filter.clone();
    let on_abort = filter.clone();
    let on_close = filter;

    Callbacks::new()
        .on_negotiate(|cx, _, _| Box::pin(handle_negotiate(cx)))
        .on_connect(move |cx, hostname, socket_info| {
            Box::pin(handle_connect(on_connect.clone(), cx, hostname, socket_info))
        })
        .on_helo(move |cx, helo| Box::pin(handle_helo(on_helo.clone(), cx, helo)))
        .on_mail(move |cx, args| Box::pin(handle_mail(on_mail.clone(), cx, args)))
        .on_rcpt(move |cx, args| Box::pin(handle_rcpt(on_rcpt.clone(), cx, args)))
        .on_header(move |cx, name, value| {
            Box::pin(handle_header(on_header.clone(), cx, name, value))
        })
        .on_eoh(move |cx| Box::pin(handle_eoh(on_eoh.clone(), cx)))
        .on_body(move |cx, chunk| Box::pin(handle_body(on_body.clone(), cx, chunk)))
        .on_eom(move |cx| Box::pin(handle_eom(on_eom.clone(), cx)))
        .on_abort(move |cx| Box::pin(handle_abort(on_abort.clone(), cx)))
        .on_close(move |cx| Box::pin(handle_close(on_close.clone(), cx)))
}

async fn handle_negotiate(context: &mut NegotiateContext<SessionId>) -> Status {
    context.requested_actions |= Actions::ADD_HEADER | Actions::CHANGE_HEADER;

    let macros = &mut context.requested_macros;
    macros.insert(MacroStage::Connect, c_str!("j").into());
    macros.insert(
        MacroStage::Helo,
        c_str!("{tls_version} {cipher} {cipher_bits} {cert_subject} {cert_issuer}").into(),
    );
    macros.insert(MacroStage::Mail, c_str!("{auth_authen} {auth_type}").into());
    macros.insert(MacroStage::Eoh, c_str!("i {auth_authen} {auth_type}").into());
    macros.insert(MacroStage::Eom, c_str!("i").into());

    Status::Continue
}

async fn handle_connect(
    filter: Arc<Filter>,
    context: &mut Context<SessionId>,
    hostname: CString,
    socket_info: SocketInfo,
) -> Status {
    let (ip, port) = match socket_info {
        SocketInfo::Inet(addr) => (Some(addr.ip()), Some(addr.port())),
        _ => (None, None),
    };
    let reverse_dns = Some(hostname.to_string_lossy().into_owned()).filter(|h| !h.is_empty());

    match filter.connect(ip, port, reverse_dns).await {
        Some(id) => {
            context.data = Some(id);
            Status::Continue
        }
        None => Status::Tempfail,
    }
}

async fn handle_helo(filter: Arc<Filter>, context: &mut Context<SessionId>, helo: CString) -> Status {
    let macros = &context.macros;
    let tls = TlsInfo {
        version: macros.get_string(c_str!("{tls_version}")),
        cipher: macros.get_string(c_str!("{cipher}")),
        cipher_bits: macros.get_string(c_str!("{cipher_bits}")),
        cert_subject: macros.get_string(c_str!("{cert_subject}")),
        cert_issuer: macros.get_string(c_str!("{cert_issuer}")),
    };
    let helo = helo.to_string_lossy().into_owned();

    let reply = filter.helo(context.data, helo, tls).await;
    apply_reply(&mut context.reply, reply)
}

async fn handle_mail(
    filter: Arc<Filter>,
    context: &mut Context<SessionId>,
    args: Vec<CString>,
) -> Status {
    let args = lossy(args);
    let sasl = sasl_info(&context.macros);

    let reply = filter.env_from(context.data, args, sasl).await;
    apply_reply(&mut context.reply, reply)
}

async fn handle_rcpt(
    filter: Arc<Filter>,
    context: &mut Context<SessionId>,
    args: Vec<CString>,
) -> Status {
    let reply = filter.env_rcpt(context.data, lossy(args)).await;
    apply_reply(&mut context.reply, reply)
}

async fn handle_header(
    filter: Arc<Filter>,
    context: &mut Context<SessionId>,
    name: CString,
    value: CString,
) -> Status {
    let name = name.to_string_lossy().into_owned();
    let value = value.to_string_lossy().into_owned();

    let reply = filter.header(context.data, name, value).await;
    apply_reply(&mut context.reply, reply)
}

async fn handle_eoh(filter: Arc<Filter>, context: &mut Context<SessionId>) -> Status {
    let queue_id = context.macros.get_string(c_str!("i"));
    let sasl = sasl_info(&context.macros);

    let reply = filter.eoh(context.data, queue_id, sasl).await;
    apply_reply(&mut context.reply, reply)
}

async fn handle_body(
    filter: Arc<Filter>,
    context: &mut Context<SessionId>,
    chunk: impl AsRef<[u8]>,
) -> Status {
    let reply = filter.body(context.data, chunk.as_ref()).await;
    apply_reply(&mut context.reply, reply)
}

async fn handle_eom(filter: Arc<Filter>, context: &mut EomContext<SessionId>) -> Status {
    let queue_id = context.macros.get_string(c_str!("i"));
    let outcome = filter.eom(context.data, queue_id).await;

    for mutation in outcome.mutations {
        let result = match mutation {
            HeaderMutation::Add { key, value } => context.actions.add_header(key, value).await,
            HeaderMutation::Delete { key, index } => {
                let index = i32::try_from(index).unwrap_or(i32::MAX);
                context
                    .actions
                    .change_header(key, index, None::<CString>)
                    .await
            }
        };
        if let Err(e) = result {
            warn!("Failed to apply header change: {}", e);
        }
    }

    apply_reply(&mut context.reply, outcome.reply)
}

async fn handle_abort(filter: Arc<Filter>, context: &mut Context<SessionId>) -> Status {
    // The connection stays open, so the id is kept for the next message
    filter.abort(context.data).await;
    Status::Continue
}

async fn handle_close(filter: Arc<Filter>, context: &mut Context<SessionId>) -> Status {
    filter.close(context.data.take()).await;
    Status::Continue
}

fn lossy(args: Vec<CString>) -> Vec<String> {
    args.into_iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect()
}

fn sasl_info(macros: &Macros) -> SaslInfo {
    SaslInfo {
        username: macros.get_string(c_str!("{auth_authen}")),
        method: macros.get_string(c_str!("{auth_type}")),
    }
}

/// Set the SMTP reply for `reply` and return the matching status
fn apply_reply(target: &mut impl SetErrorReply, reply: Reply) -> Status {
    let (rcode, default_xcode, text, status) = match reply {
        Reply::Continue => return Status::Continue,
        Reply::TempFail(text) => ("451", "4.7.0", text, Status::Tempfail),
        Reply::Reject(text) => ("550", "5.7.1", text, Status::Reject),
    };

    let (xcode, text) = split_enhanced_code(&text);
    let xcode = xcode.unwrap_or(default_xcode);

    if let Err(e) = target.set_error_reply(rcode, Some(xcode), [text]) {
        warn!(rcode, xcode, "Failed to set SMTP reply: {}", e);
    }
    status
}

/// Split a leading enhanced status code such as `5.1.1` off a reply text
fn split_enhanced_code(text: &str) -> (Option<&str>, &str) {
    let (first, rest) = match text.split_once(' ') {
        Some((first, rest)) => (first, rest.trim_start()),
        None => (text, ""),
    };

    let parts: Vec<&str> = first.split('.').collect();
    let is_code = parts.len() == 3
        && matches!(parts[0], "2" | "4" | "5")
        && parts[1..]
            .iter()
            .all(|p| !p.is_empty() && p.len() <= 3 && p.bytes().all(|b| b.is_ascii_digit()));

    if is_code && !rest.is_empty() {
        (Some(first), rest)
    } else {
        (None, text)
    }
}
