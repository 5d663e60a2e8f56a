use anyhow::{anyhow, Result};
use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use super::{LocalView, ViewChange};
use crate::error::BackoffPolicy;
use crate::session::ServerMessage;

/// Something the monitor wants to tell its caller
#[derive(Debug)]
pub enum MonitorEvent<'a> {
    Connected { url: &'a Url },
    Message {
        message: &'a ServerMessage,
        change: &'a ViewChange,
    },
    Disconnected { reason: String },
    Retrying { attempt: u32, delay: std::time::Duration },
}

/// Observer endpoint for a relay base URL: `http(s)://host` -> `ws(s)://host/ws`.
pub fn ws_url(base: &str) -> Result<Url> {
    let mut url = Url::parse(base).map_err(|e| anyhow!("invalid server url '{base}': {e}"))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(anyhow!("unsupported url scheme '{other}'")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot use scheme '{scheme}' for {base}"))?;
    url.set_path("/ws");
    Ok(url)
}

/// Follow the relay at `url`, folding every message into `view`.
///
/// Reconnects per `policy`; the attempt counter starts over after each
/// successful connection. Returns once the policy gives up.
pub async fn monitor<F>(url: &Url, policy: &BackoffPolicy, view: &mut LocalView, mut on_event: F) -> Result<()>
where
    F: FnMut(MonitorEvent<'_>, &LocalView),
{
    let mut backoff = policy.backoff();

    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                backoff.reset();
                on_event(MonitorEvent::Connected { url }, view);

                let (_sink, mut inbound) = stream.split();
                let reason = loop {
                    match inbound.next().await {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerMessage>(text.as_str()) {
                                Ok(message) => {
                                    let change = view.apply(&message);
                                    on_event(
                                        MonitorEvent::Message {
                                            message: &message,
                                            change: &change,
                                        },
                                        view,
                                    );
                                }
                                Err(err) => warn!(error = %err, "unreadable relay message"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break "connection closed".to_string(),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break err.to_string(),
                    }
                };
                on_event(MonitorEvent::Disconnected { reason }, view);
            }
            Err(err) => {
                debug!(error = %err, %url, "relay connection failed");
                on_event(
                    MonitorEvent::Disconnected {
                        reason: err.to_string(),
                    },
                    view,
                );
            }
        }

        let Some(delay) = backoff.next_delay() else {
            return Err(anyhow!(
                "gave up on {url} after {} attempts",
                backoff.attempts()
            ));
        };
        on_event(
            MonitorEvent::Retrying {
                attempt: backoff.attempts(),
                delay,
            },
            view,
        );
        tokio::time::sleep(delay).await;
    }
}
