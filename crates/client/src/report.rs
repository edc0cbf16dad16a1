use predsync_core::domain::prediction::Signal;
use predsync_core::push::client::ConnectionState;
use predsync_core::session::SyncView;

/// One observable difference between two consecutive views.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewChange {
    Connection {
        from: ConnectionState,
        to: ConnectionState,
    },
    Added {
        ticker: String,
        signal: Signal,
    },
    SignalChanged {
        ticker: String,
        from: Signal,
        to: Signal,
        score: f64,
    },
    ErrorRaised {
        source: ErrorSource,
        message: String,
    },
    ErrorCleared {
        source: ErrorSource,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Push,
    Poll,
}

impl ErrorSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Poll => "poll",
        }
    }
}

/// Score-only drift is left out; it changes every simulator tick.
pub fn diff_views(prev: &SyncView, next: &SyncView) -> Vec<ViewChange> {
    let mut out = Vec::new();

    if prev.connection != next.connection {
        out.push(ViewChange::Connection {
            from: prev.connection,
            to: next.connection,
        });
    }

    for record in &next.records {
        match prev.records.iter().find(|r| r.ticker == record.ticker) {
            None => out.push(ViewChange::Added {
                ticker: record.ticker.clone(),
                signal: record.signal,
            }),
            Some(old) if old.signal != record.signal => out.push(ViewChange::SignalChanged {
                ticker: record.ticker.clone(),
                from: old.signal,
                to: record.signal,
                score: record.score,
            }),
            Some(_) => {}
        }
    }

    diff_error(ErrorSource::Push, &prev.push_error, &next.push_error, &mut out);
    diff_error(ErrorSource::Poll, &prev.poll_error, &next.poll_error, &mut out);

    out
}

fn diff_error(source: ErrorSource, prev: &Option<String>, next: &Option<String>, out: &mut Vec<ViewChange>) {
    match (prev, next) {
        (_, Some(message)) if prev.as_ref() != Some(message) => out.push(ViewChange::ErrorRaised {
            source,
            message: message.clone(),
        }),
        (Some(_), None) => out.push(ViewChange::ErrorCleared { source }),
        _ => {}
    }
}

pub fn log_change(change: &ViewChange) {
    match change {
        ViewChange::Connection { from, to } => {
            tracing::info!(?from, ?to, "push connection changed")
        }
        ViewChange::Added { ticker, signal } => {
            tracing::info!(%ticker, signal = signal.as_str(), "prediction added")
        }
        ViewChange::SignalChanged {
            ticker,
            from,
            to,
            score,
        } => tracing::info!(
            %ticker,
            from = from.as_str(),
            to = to.as_str(),
            score = format!("{score:.3}"),
            "signal changed"
        ),
        ViewChange::ErrorRaised { source, message } => tracing::warn!(
            source = source.as_str(),
            error = %message,
            "sync degraded; showing last known state"
        ),
        ViewChange::ErrorCleared { source } => tracing::info!(source = source.as_str(), "sync recovered"),
    }
}
