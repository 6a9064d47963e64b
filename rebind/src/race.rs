//! First-success race over a set of candidate futures.
//!
//! `first_ok` resolves with the first candidate that completes successfully,
//! not the first that settles: an early failure never decides the race, and a
//! slow success can still win. The race fails only once every candidate has
//! failed, with the errors collected in completion order. As soon as a winner
//! emerges, every candidate still running is cancelled, and any result a
//! candidate produced after the win is dropped with the race.

use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Cancels the candidate tasks when the race is won, lost, or abandoned.
struct CandidateTasks(Vec<JoinHandle<()>>);

impl Drop for CandidateTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Race `candidates`, resolving on the first success.
///
/// Losing candidates are cancelled the moment the winner is known, dropping
/// whatever they owned; abandoning the returned future cancels every
/// candidate still running. An empty candidate set fails immediately with no
/// errors.
pub async fn first_ok<F, T, E>(candidates: Vec<F>) -> Result<T, Vec<E>>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut tasks = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            let _ = tx.send(candidate.await);
        }));
    }
    drop(tx);
    let _tasks = CandidateTasks(tasks);

    let mut failures = Vec::new();
    while let Some(result) = rx.recv().await {
        match result {
            // Returning drops `_tasks`, cancelling the candidates still
            // running, and `rx`, dropping anything buffered after the win.
            Ok(winner) => return Ok(winner),
            Err(e) => failures.push(e),
        }
    }
    Err(failures)
}
