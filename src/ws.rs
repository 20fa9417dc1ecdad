//! WebSocket endpoint: capability document, frame dispatch, responses.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::event::Event;
use crate::filter::{ChangesOptions, Filter};
use crate::kind::KindClass;
use crate::proto::{ClientFrame, RelayFrame};
use crate::relay::{Client, Relay};
use crate::store::{ChangeScan, IngestOutcome};
use crate::validate;

/// Content type that selects the capability document over the upgrade.
const CAPABILITY_TYPE: &str = "application/nostr+json";

/// Start the relay endpoint on `addr`.
pub async fn serve(
    addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new().route("/", get(handler)).with_state(relay);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Relay metadata served to clients that ask for the capability document.
#[derive(Serialize)]
struct RelayInfo {
    name: String,
    software: String,
    version: String,
    commands: Vec<&'static str>,
}

fn capability_doc() -> impl IntoResponse {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(RelayInfo {
            name: "seqr".into(),
            software: "seqr".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            commands: vec![
                "EVENT",
                "REQ",
                "CLOSE",
                "CHANGES",
                "LASTSEQ",
                "CHANGES_SUB",
                "CHANGES_UNSUB",
            ],
        }),
    )
}

/// Serve the capability document or accept the upgrade.
async fn handler(
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    State(relay): State<Arc<Relay>>,
) -> Response {
    let wants_doc = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains(CAPABILITY_TYPE))
        .unwrap_or(false);
    match ws {
        Some(ws) if !wants_doc => {
            ws.on_upgrade(move |socket| process(socket, relay)).into_response()
        }
        _ => capability_doc().into_response(),
    }
}

/// Pump one connection: reader here, writer on its own task.
async fn process(socket: WebSocket, relay: Arc<Relay>) {
    let (mut sink, mut stream) = socket.split();
    let (conn_id, client, mut outbox) = relay.register();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    client.send(&RelayFrame::notice("binary frame is not valid UTF-8"));
                    continue;
                }
            },
            Message::Close(_) => break,
            _ => continue,
        };
        dispatch(&relay, &client, &text);
    }

    relay.unregister(conn_id);
    drop(client);
    let _ = writer.await;
}

/// Route one parsed frame to its command handler.
fn dispatch(relay: &Relay, client: &Client, text: &str) {
    let frame = match ClientFrame::from_json(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "rejecting client frame");
            client.send(&RelayFrame::notice(e.to_string()));
            return;
        }
    };
    match frame {
        ClientFrame::Event(raw) => handle_event(relay, client, raw),
        ClientFrame::Req { sub_id, filters } => handle_req(relay, client, sub_id, &filters),
        ClientFrame::Close { sub_id } => client.remove_sub(&sub_id),
        ClientFrame::Changes(options) => handle_changes(relay, client, &options),
        ClientFrame::LastSeq => match relay.store().last_seq() {
            Ok(seq) => client.send(&RelayFrame::LastSeq(seq)),
            Err(e) => client.send(&RelayFrame::notice(format!("error: {e}"))),
        },
        ClientFrame::ChangesSub { sub_id, options } => {
            handle_changes_sub(relay, client, sub_id, &options)
        }
        ClientFrame::ChangesUnsub { sub_id } => client.remove_feed(&sub_id),
    }
}

fn handle_event(relay: &Relay, client: &Client, raw: Value) {
    let event_id = raw
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let ev: Event = match serde_json::from_value(raw) {
        Ok(ev) => ev,
        Err(e) => {
            client.send(&RelayFrame::ok(
                event_id,
                false,
                format!("invalid: malformed event: {e}"),
            ));
            return;
        }
    };
    if let Err(e) = validate::validate_event(&ev, validate::unix_now()) {
        client.send(&RelayFrame::ok(ev.id, false, e.to_string()));
        return;
    }
    let class = match validate::classify_kind(&ev) {
        Ok(class) => class,
        Err(e) => {
            client.send(&RelayFrame::ok(ev.id, false, e.to_string()));
            return;
        }
    };
    if class == KindClass::Purge {
        if let Err(e) = validate::purge_target(&ev) {
            client.send(&RelayFrame::ok(ev.id, false, e.to_string()));
            return;
        }
    }
    match relay.publish(&ev, class) {
        Ok(IngestOutcome::Stored { .. }) | Ok(IngestOutcome::Ephemeral) => {
            client.send(&RelayFrame::ok(ev.id, true, ""));
        }
        Ok(IngestOutcome::Duplicate { .. }) => {
            client.send(&RelayFrame::ok(
                ev.id,
                true,
                "duplicate: already have this event",
            ));
        }
        Ok(IngestOutcome::Superseded { class }) => {
            client.send(&RelayFrame::ok(
                ev.id,
                true,
                format!(
                    "duplicate: have a newer version of this {} event",
                    class.label()
                ),
            ));
        }
        Err(e) => {
            client.send(&RelayFrame::ok(ev.id, false, format!("error: {e}")));
        }
    }
}

fn handle_req(relay: &Relay, client: &Client, sub_id: String, raw_filters: &[Value]) {
    if sub_id.is_empty() || sub_id.len() > 64 {
        client.send(&RelayFrame::closed(
            sub_id,
            "invalid: subscription id must be 1-64 characters",
        ));
        return;
    }
    let mut filters = Vec::with_capacity(raw_filters.len());
    for raw in raw_filters {
        match Filter::from_value(raw) {
            Ok(filter) => filters.push(filter),
            Err(e) => {
                client.send(&RelayFrame::closed(sub_id, e.to_string()));
                return;
            }
        }
    }
    client.set_sub(sub_id.clone(), filters.clone());
    match relay.store().query(&filters) {
        Ok(events) => {
            for ev in events {
                client.send(&RelayFrame::event(&sub_id, ev));
            }
            client.send(&RelayFrame::eose(sub_id));
        }
        Err(e) => client.send(&RelayFrame::notice(format!("error: {e}"))),
    }
}

fn handle_changes(relay: &Relay, client: &Client, options: &Value) {
    let opts = match ChangesOptions::from_value(options) {
        Ok(opts) => opts,
        Err(e) => {
            client.send(&RelayFrame::notice(e.to_string()));
            return;
        }
    };
    let scan = ChangeScan {
        limit: opts.limit,
        kinds: opts.kinds,
        authors: opts.authors,
    };
    match relay.store().query_changes(opts.since, &scan) {
        Ok((changes, last_seq)) => {
            client.send(&RelayFrame::Changes { changes, last_seq });
        }
        Err(e) => client.send(&RelayFrame::notice(format!("error: {e}"))),
    }
}

fn handle_changes_sub(relay: &Relay, client: &Client, sub_id: String, options: &Value) {
    if sub_id.is_empty() || sub_id.len() > 64 {
        client.send(&RelayFrame::closed(
            sub_id,
            "invalid: subscription id must be 1-64 characters",
        ));
        return;
    }
    let opts = match ChangesOptions::from_value(options) {
        Ok(opts) => opts,
        Err(e) => {
            client.send(&RelayFrame::closed(sub_id, e.to_string()));
            return;
        }
    };
    if let Err(e) = relay.subscribe_changes(client, sub_id, opts) {
        client.send(&RelayFrame::notice(format!("error: {e}")));
    }
}
