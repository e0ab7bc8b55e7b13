use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use si_events::Envelope;
use tokio_stream::StreamExt as _;

use crate::AppState;

/// Live event stream with journal-backed resume.
///
/// `?after=<id>` (or `Last-Event-ID`) replays everything the journal holds
/// past that row; `?replay=N` replays the last N envelopes; `?prefix=a,b`
/// filters live delivery by topic prefix.
pub async fn events_sse(
    State(state): State<AppState>,
    Query(q): Query<std::collections::HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let (tx, rx) = tokio::sync::mpsc::channel::<(Envelope, Option<String>)>(128);

    // Optional resume: prioritize after=ID or Last-Event-ID over replay
    let mut did_replay = false;
    let last_event_id_hdr: Option<String> = headers
        .get("last-event-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());
    if let Some(after_s) = q.get("after").cloned().or(last_event_id_hdr) {
        if let Ok(aid) = after_s.parse::<i64>() {
            if let Ok(rows) = state.kernel().recent_events_async(1000, Some(aid)).await {
                let tx2 = tx.clone();
                tokio::spawn(async move {
                    for r in rows {
                        let env = Envelope {
                            time: r.time,
                            kind: r.kind,
                            payload: r.payload,
                        };
                        let _ = tx2.send((env, Some(r.id.to_string()))).await;
                    }
                });
                did_replay = true;
            }
        }
    }
    if !did_replay {
        if let Some(n) = q.get("replay").and_then(|s| s.parse::<i64>().ok()) {
            if n > 0 {
                if let Ok(rows) = state.kernel().recent_events_async(n, None).await {
                    let tx2 = tx.clone();
                    tokio::spawn(async move {
                        for r in rows {
                            let env = Envelope {
                                time: r.time,
                                kind: r.kind,
                                payload: r.payload,
                            };
                            let _ = tx2.send((env, Some(r.id.to_string()))).await;
                        }
                    });
                }
            }
        }
    }

    // Optional prefix filter (CSV)
    let prefixes: Vec<String> = q
        .get("prefix")
        .map(|s| {
            s.split(',')
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(|p| p.to_string())
                .collect()
        })
        .unwrap_or_default();
    let mut bus_rx = state.bus().subscribe();
    tokio::spawn(async move {
        while let Ok(env) = bus_rx.recv().await {
            if prefixes.is_empty() || prefixes.iter().any(|p| env.kind.starts_with(p)) {
                let _ = tx.send((env, None)).await;
            }
        }
    });

    let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(|(env, sid)| {
        let mut ev = SseEvent::default().event(env.kind.clone());
        if let Some(id) = sid {
            ev = ev.id(id);
        }
        ev = ev.data(serde_json::to_string(&env).unwrap_or("{}".to_string()));
        Result::<SseEvent, std::convert::Infallible>::Ok(ev)
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(10))
            .text("keep-alive"),
    )
}
