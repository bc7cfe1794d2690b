//! The context side of the isolation protocol.
//!
//! A worker binary builds a [`WorkerRegistry`] with the same registrations
//! as the dispatching process and hands control to [`serve`]; from then on
//! it executes whatever jobs the pool sends until its stdin closes. The
//! handler surface is identical to a local worker.
//!
//! ```no_run
//! # use izi::registry::WorkerRegistry;
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let registry = WorkerRegistry::new();
//!     // registry.register(ResizeImage);
//!     izi::isolation::serve(registry).await
//! }
//! ```

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::proto::{Outcome, Request, Response};
use crate::registry::WorkerRegistry;
use crate::worker::{panic_message, WorkerResult};

/// Serves jobs from stdin until EOF. Never returns in normal pool operation;
/// the pool closes the pipe or kills the process.
pub async fn serve(registry: WorkerRegistry) -> std::io::Result<()> {
    serve_on(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), registry).await
}

/// [`serve`] over arbitrary streams, for embedding and tests.
pub async fn serve_on<R, W>(reader: R, mut writer: W, registry: WorkerRegistry) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<Request>(&line) {
            Ok(request) => request,
            Err(error) => {
                tracing::error!(?error, "discarding unparseable request");
                continue;
            }
        };

        let response = handle(&registry, request).await;
        let mut encoded = serde_json::to_vec(&response).map_err(std::io::Error::other)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn handle(registry: &WorkerRegistry, request: Request) -> Response {
    let Request::Execute { job_id, job, worker } = request;

    let Some(handler) = registry.get(&worker) else {
        return Response::Error {
            job_id,
            error: format!("worker {worker} not registered"),
            stack: None,
        };
    };

    // run in a task so a panicking handler becomes an error response
    // instead of killing the context
    let result = tokio::spawn(async move { handler.perform(job).await }).await;

    match result {
        Ok(WorkerResult::Done(value)) => Response::Result {
            job_id,
            result: Outcome::Ok { value },
        },
        Ok(WorkerResult::Cancelled { reason }) => Response::Result {
            job_id,
            result: Outcome::Cancelled { reason },
        },
        Ok(WorkerResult::Snooze { delay }) => Response::Result {
            job_id,
            result: Outcome::Snooze {
                seconds: delay.num_seconds().max(0) as u64,
            },
        },
        Ok(WorkerResult::Error(error)) => Response::Error {
            job_id,
            error: error.to_string(),
            stack: None,
        },
        Err(join_error) => Response::Error {
            job_id,
            error: panic_message(join_error),
            stack: None,
        },
    }
}
