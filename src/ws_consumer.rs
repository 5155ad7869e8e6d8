//! Zap-feed WebSocket consumer. Reconnects indefinitely with exponential
//! backoff capped at 64 s; the connection itself supplies ping/pong
//! keepalive. Each frame is a JSON payment notification handed to the
//! Zap Pipeline; one malformed frame never kills the connection.

use crate::zap_pipeline::{PaymentNotification, ZapPipeline};
use futures_util::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(64);

#[derive(Deserialize)]
struct PaymentFrame {
    payment: PaymentBody,
    wallet_balance: Option<i64>,
}

#[derive(Deserialize)]
struct PaymentBody {
    payment_hash: String,
    amount: i64,
    description: Option<String>,
    extra: Option<ExtraBody>,
}

#[derive(Deserialize)]
struct ExtraBody {
    nostr: Option<serde_json::Value>,
}

fn parse_frame(text: &str) -> Option<PaymentNotification> {
    let frame: PaymentFrame = serde_json::from_str(text).ok()?;
    let extra_nostr = frame.payment.extra.and_then(|e| e.nostr).map(|v| match v {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    });
    Some(PaymentNotification {
        payment_hash: frame.payment.payment_hash,
        amount_msat: frame.payment.amount,
        description: frame.payment.description,
        extra_nostr,
        wallet_balance: frame.wallet_balance,
    })
}

/// Runs forever, reconnecting on every disconnect or error.
pub async fn run(url: String, pipeline: ZapPipeline) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _response)) => {
                tracing::info!(%url, "zap feed connected");
                backoff = INITIAL_BACKOFF;
                let (_write, mut read) = stream.split();
                while let Some(message) = read.next().await {
                    match message {
                        Ok(Message::Text(text)) => match parse_frame(&text) {
                            Some(notification) => {
                                if let Err(e) = pipeline.handle_payment(notification).await {
                                    tracing::warn!(error = %e, "failed to process payment notification");
                                }
                            }
                            None => tracing::warn!("dropped malformed payment frame"),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "zap feed read error");
                            break;
                        }
                    }
                }
                tracing::warn!("zap feed disconnected; reconnecting");
            }
            Err(e) => {
                tracing::warn!(error = %e, backoff_secs = backoff.as_secs(), "zap feed connect failed");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_frame() {
        let text = r#"{"payment": {"payment_hash": "abc", "amount": 50000, "description": null, "extra": null}, "wallet_balance": 500}"#;
        let notification = parse_frame(text).unwrap();
        assert_eq!(notification.payment_hash, "abc");
        assert_eq!(notification.amount_msat, 50000);
        assert_eq!(notification.wallet_balance, Some(500));
    }

    #[test]
    fn malformed_frame_yields_none() {
        assert!(parse_frame("not json").is_none());
    }

    #[test]
    fn extra_nostr_object_is_preserved_as_json_string() {
        let text = r#"{"payment": {"payment_hash": "abc", "amount": 1000, "extra": {"nostr": {"kind": 9734}}}}"#;
        let notification = parse_frame(text).unwrap();
        assert!(notification.extra_nostr.unwrap().contains("9734"));
    }
}
