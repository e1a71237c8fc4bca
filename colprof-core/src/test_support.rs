//! Scripted transport and result recorder shared by the unit tests.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{QueryError, TransportError};
use crate::transport::{Transport, TransportFuture};

struct Call<P, R> {
    label: String,
    payload: P,
    reply: Option<oneshot::Sender<Result<R, TransportError>>>,
    cancel: CancellationToken,
}

/// Transport whose calls stay open until the test answers them
pub(crate) struct ScriptedTransport<P, R> {
    calls: Arc<Mutex<Vec<Call<P, R>>>>,
    label: fn(&P) -> String,
}

impl<P, R> Clone for ScriptedTransport<P, R> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
            label: self.label,
        }
    }
}

impl<R> ScriptedTransport<String, R> {
    pub(crate) fn new() -> Self {
        Self::labelled(|payload| payload.clone())
    }
}

impl<P, R> ScriptedTransport<P, R> {
    pub(crate) fn labelled(label: fn(&P) -> String) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            label,
        }
    }

    /// Labels of every call made so far, in call order
    pub(crate) fn started(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.label.clone()).collect()
    }

    pub(crate) fn payloads(&self) -> Vec<P>
    where
        P: Clone,
    {
        self.calls.lock().unwrap().iter().map(|c| c.payload.clone()).collect()
    }

    pub(crate) fn resolve(&self, label: &str, value: impl Into<R>) {
        self.reply(label, Ok(value.into()));
    }

    pub(crate) fn reject(&self, label: &str, error: TransportError) {
        self.reply(label, Err(error));
    }

    pub(crate) fn resolve_all(&self, value: impl Into<R>)
    where
        R: Clone,
    {
        let value = value.into();
        let mut calls = self.calls.lock().unwrap();
        for call in calls.iter_mut() {
            if let Some(reply) = call.reply.take() {
                let _ = reply.send(Ok(value.clone()));
            }
        }
    }

    pub(crate) fn oldest_open(&self) -> Option<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.reply.is_some() && !c.cancel.is_cancelled())
            .map(|c| c.label.clone())
    }

    pub(crate) fn open_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.reply.is_some() && !c.cancel.is_cancelled())
            .count()
    }

    pub(crate) fn was_cancelled(&self, label: &str) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.label == label && c.cancel.is_cancelled())
    }

    fn reply(&self, label: &str, result: Result<R, TransportError>) {
        let mut calls = self.calls.lock().unwrap();
        let call = calls
            .iter_mut()
            .find(|c| c.label == label && c.reply.is_some())
            .unwrap_or_else(|| panic!("no open call labelled {}", label));
        if let Some(reply) = call.reply.take() {
            let _ = reply.send(result);
        }
    }
}

impl<P, R> Transport<P, R> for ScriptedTransport<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    fn send(&self, payload: P, cancel: CancellationToken) -> TransportFuture<R> {
        let (tx, rx) = oneshot::channel();
        self.calls.lock().unwrap().push(Call {
            label: (self.label)(&payload),
            payload,
            reply: Some(tx),
            cancel,
        });
        Box::pin(async move {
            rx.await
                .unwrap_or_else(|_| Err(TransportError::connection("scripted call dropped")))
        })
    }
}

/// Collects settle outcomes by label
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    outcomes: Arc<Mutex<Vec<(String, Option<QueryError>)>>>,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn callback<R: Send + 'static>(
        &self,
        label: impl Into<String>,
    ) -> impl FnOnce(Result<R, QueryError>) + Send + 'static {
        let outcomes = Arc::clone(&self.outcomes);
        let label = label.into();
        move |result| {
            outcomes.lock().unwrap().push((label, result.err()));
        }
    }

    pub(crate) fn resolved(&self) -> Vec<String> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, err)| err.is_none())
            .map(|(label, _)| label.clone())
            .collect()
    }

    pub(crate) fn rejected(&self) -> Vec<(String, QueryError)> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(label, err)| err.clone().map(|e| (label.clone(), e)))
            .collect()
    }
}

/// Let spawned dispatch and watcher tasks run to quiescence
pub(crate) async fn settle_tasks() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
