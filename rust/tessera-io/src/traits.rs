// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use tessera_core::Result;

/// A writer that knows how many bytes it has accepted.
#[async_trait]
pub trait Writer: AsyncWrite + Unpin + Send {
    /// Tell the current offset.
    async fn tell(&mut self) -> Result<usize>;
}
