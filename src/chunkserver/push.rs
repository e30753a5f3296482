use std::time::Instant;

use crate::common::ServerId;
use crate::error::{GfsError, Result};
use crate::msg::{PushData, Request, Response};

use super::Chunkserver;

impl Chunkserver {
    /// One hop of the push pipeline: stage the block locally while forwarding
    /// it to the rest of the chain, and succeed only if both did.
    pub(crate) async fn handle_push(&self, push: PushData) -> Result<()> {
        let PushData { token, chunk, data, chain } = push;

        let max = self.geometry.max_write();
        if data.len() as u64 > max {
            return Err(GfsError::WriteTooLarge { len: data.len() as u64, max });
        }

        let downstream = chain.split_first().map(|(next, rest)| {
            let req = Request::PushData(PushData { token, chunk, data: data.clone(), chain: rest.to_vec() });
            (next.clone(), req)
        });

        let forward = async {
            match downstream {
                Some((next, req)) => self.forward_push(next, req).await,
                None => Ok(()),
            }
        };
        let store = async { self.staging().put(token, chunk, data, Instant::now()) };

        tokio::try_join!(store, forward)?;
        tracing::debug!(server = %self.id, chunk, token = %token, "staged push");
        Ok(())
    }

    async fn forward_push(&self, next: ServerId, req: Request) -> Result<()> {
        match self.call(&next, req).await.and_then(Response::ok) {
            Ok(()) => Ok(()),
            // Already names the hop that failed further down.
            Err(e @ GfsError::PushFailed { .. }) => Err(e),
            Err(e) => Err(GfsError::PushFailed { hop: next, reason: e.to_string() }),
        }
    }
}
