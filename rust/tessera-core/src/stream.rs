// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Record batch streams and the sources a writer can consume.

use std::pin::Pin;
use std::task::{Context, Poll};

use arrow_array::{RecordBatch, RecordBatchIterator, RecordBatchReader};
use arrow_schema::{ArrowError, SchemaRef};
use futures::{stream, Stream, StreamExt, TryFutureExt};
use pin_project::pin_project;
use snafu::location;
use tokio::task::spawn_blocking;

use crate::datatypes::Schema;
use crate::{Error, Result};

/// A stream of [`RecordBatch`]es that knows its schema up front.
pub trait RecordBatchStream: Stream<Item = Result<RecordBatch>> + Send {
    fn schema(&self) -> SchemaRef;
}

pub type SendableRecordBatchStream = Pin<Box<dyn RecordBatchStream>>;

/// Combines a schema with a plain stream of batches.
#[pin_project]
pub struct RecordBatchStreamAdapter<S> {
    schema: SchemaRef,
    #[pin]
    stream: S,
}

impl<S> RecordBatchStreamAdapter<S> {
    pub fn new(schema: SchemaRef, stream: S) -> Self {
        Self { schema, stream }
    }
}

impl<S> std::fmt::Debug for RecordBatchStreamAdapter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordBatchStreamAdapter")
            .field("schema", &self.schema)
            .finish()
    }
}

impl<S> Stream for RecordBatchStreamAdapter<S>
where
    S: Stream<Item = Result<RecordBatch>>,
{
    type Item = Result<RecordBatch>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().stream.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.stream.size_hint()
    }
}

impl<S> RecordBatchStream for RecordBatchStreamAdapter<S>
where
    S: Stream<Item = Result<RecordBatch>> + Send,
{
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

fn background_iterator<I: Iterator + Send + 'static>(iter: I) -> impl Stream<Item = I::Item>
where
    I::Item: Send,
{
    stream::unfold(iter, |mut iter| {
        spawn_blocking(|| iter.next().map(|val| (val, iter)))
            .unwrap_or_else(|err| panic!("{}", err))
    })
    .fuse()
}

/// Convert a blocking [`RecordBatchReader`] into a stream.
///
/// The reader is pulled on the blocking thread pool. Errors raised by the
/// reader are reported as [`Error::Upstream`].
pub fn reader_to_stream(batches: Box<dyn RecordBatchReader + Send>) -> SendableRecordBatchStream {
    let arrow_schema = batches.schema();
    let stream = RecordBatchStreamAdapter::new(
        arrow_schema,
        background_iterator(batches)
            .map(|batch| batch.map_err(|e: ArrowError| Error::upstream(e, location!()))),
    );
    Box::pin(stream)
}

/// A trait for [RecordBatch] iterators, readers and streams
/// that can be converted to a concrete stream type [SendableRecordBatchStream].
pub trait StreamingWriteSource: Send {
    /// Convert to a stream and derive the Tessera schema of its batches.
    ///
    /// Field ids are assigned in pre-order starting at 0. This does not
    /// check the schema against an existing dataset.
    fn into_stream_and_schema(self) -> Result<(SendableRecordBatchStream, Schema)>
    where
        Self: Sized,
    {
        let arrow_schema = self.arrow_schema();
        let schema = Schema::try_from(arrow_schema.as_ref())?;
        schema.validate()?;
        Ok((self.into_stream(), schema))
    }

    /// Returns the arrow schema.
    fn arrow_schema(&self) -> SchemaRef;

    /// Convert to a stream.
    ///
    /// Blocking readers are pulled in a background thread.
    fn into_stream(self) -> SendableRecordBatchStream;
}

impl<I> StreamingWriteSource for RecordBatchIterator<I>
where
    Self: Send,
    I: IntoIterator<Item = ::core::result::Result<RecordBatch, ArrowError>> + Send + 'static,
{
    #[inline]
    fn arrow_schema(&self) -> SchemaRef {
        RecordBatchReader::schema(self)
    }

    #[inline]
    fn into_stream(self) -> SendableRecordBatchStream {
        reader_to_stream(Box::new(self))
    }
}

impl StreamingWriteSource for Box<dyn RecordBatchReader + Send> {
    #[inline]
    fn arrow_schema(&self) -> SchemaRef {
        RecordBatchReader::schema(self.as_ref())
    }

    #[inline]
    fn into_stream(self) -> SendableRecordBatchStream {
        reader_to_stream(self)
    }
}

impl StreamingWriteSource for SendableRecordBatchStream {
    #[inline]
    fn arrow_schema(&self) -> SchemaRef {
        RecordBatchStream::schema(&**self)
    }

    #[inline]
    fn into_stream(self) -> SendableRecordBatchStream {
        self
    }
}

/// In-memory batches paired with their schema.
impl StreamingWriteSource for (SchemaRef, Vec<RecordBatch>) {
    fn arrow_schema(&self) -> SchemaRef {
        self.0.clone()
    }

    fn into_stream(self) -> SendableRecordBatchStream {
        let (schema, batches) = self;
        Box::pin(RecordBatchStreamAdapter::new(
            schema,
            stream::iter(batches.into_iter().map(Ok)),
        ))
    }
}
