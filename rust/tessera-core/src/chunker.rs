// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Regroup a stream of batches into row groups.

use std::collections::VecDeque;
use std::pin::Pin;

use arrow_array::RecordBatch;
use futures::{Stream, StreamExt, TryStreamExt};

use crate::stream::SendableRecordBatchStream;
use crate::{Error, Result};

/// Rows pulled from the source that have not been handed out yet.
struct PendingRows {
    source: SendableRecordBatchStream,
    batches: VecDeque<RecordBatch>,
    num_rows: usize,
    exhausted: bool,
}

impl PendingRows {
    fn new(source: SendableRecordBatchStream) -> Self {
        Self {
            source,
            batches: VecDeque::new(),
            num_rows: 0,
            exhausted: false,
        }
    }

    /// Pull from the source until `rows` rows are pending or it runs dry.
    async fn fill(&mut self, rows: usize) -> Result<()> {
        while !self.exhausted && self.num_rows < rows {
            match self.source.try_next().await? {
                Some(batch) if batch.num_rows() == 0 => {}
                Some(batch) => {
                    self.num_rows += batch.num_rows();
                    self.batches.push_back(batch);
                }
                None => self.exhausted = true,
            }
        }
        Ok(())
    }

    /// Take up to `rows` rows off the front. Batches are sliced, never copied.
    fn take(&mut self, rows: usize) -> Vec<RecordBatch> {
        let mut remaining = rows.min(self.num_rows);
        self.num_rows -= remaining;

        let mut group = Vec::new();
        while remaining > 0 {
            let Some(batch) = self.batches.pop_front() else {
                break;
            };
            if batch.num_rows() <= remaining {
                remaining -= batch.num_rows();
                group.push(batch);
            } else {
                group.push(batch.slice(0, remaining));
                self.batches
                    .push_front(batch.slice(remaining, batch.num_rows() - remaining));
                remaining = 0;
            }
        }
        group
    }
}

/// Group the batches of `stream` into chunks of exactly `chunk_size` rows,
/// except for the last chunk which may be smaller.
///
/// Input batch boundaries are not preserved and empty batches are dropped.
/// An error from the inner stream is yielded in place and ends the chunking.
pub fn chunk_stream(
    stream: SendableRecordBatchStream,
    chunk_size: usize,
) -> Pin<Box<dyn Stream<Item = Result<Vec<RecordBatch>>> + Send>> {
    let chunk_size = chunk_size.max(1);
    futures::stream::try_unfold(PendingRows::new(stream), move |mut pending| async move {
        pending.fill(chunk_size).await?;
        let group = pending.take(chunk_size);
        Ok::<_, Error>((!group.is_empty()).then_some((group, pending)))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::cast::AsArray;
    use arrow_array::types::Int32Type;
    use arrow_array::{Int32Array, RecordBatch};
    use arrow_schema::{DataType, Field, Schema};
    use futures::{StreamExt, TryStreamExt};
    use rstest::rstest;
    use snafu::location;

    use super::*;
    use crate::stream::RecordBatchStreamAdapter;

    fn counting_stream(sizes: &[i32]) -> SendableRecordBatchStream {
        let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::Int32, false)]));
        let mut start = 0;
        let batches = sizes
            .iter()
            .map(|size| {
                let values = Int32Array::from_iter_values(start..start + size);
                start += size;
                Ok::<_, Error>(RecordBatch::try_new(schema.clone(), vec![Arc::new(values)]).unwrap())
            })
            .collect::<Vec<_>>();
        Box::pin(RecordBatchStreamAdapter::new(
            schema,
            futures::stream::iter(batches),
        ))
    }

    #[rstest]
    #[case::split_and_merge(vec![10, 5, 13, 0], 10, vec![vec![10], vec![5, 5], vec![8]])]
    #[case::one_large_batch(vec![7], 3, vec![vec![3], vec![3], vec![1]])]
    #[case::exact_fit(vec![2, 2], 4, vec![vec![2, 2]])]
    #[case::only_empty(vec![0, 0], 4, vec![])]
    #[case::zero_size_is_one(vec![2], 0, vec![vec![1], vec![1]])]
    #[tokio::test]
    async fn test_chunk_sizes(
        #[case] input: Vec<i32>,
        #[case] chunk_size: usize,
        #[case] expected: Vec<Vec<usize>>,
    ) {
        let chunks = chunk_stream(counting_stream(&input), chunk_size)
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        let sizes = chunks
            .iter()
            .map(|chunk| chunk.iter().map(|b| b.num_rows()).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        assert_eq!(sizes, expected);

        // Rows come out in order
        let values = chunks
            .iter()
            .flatten()
            .flat_map(|b| b.column(0).as_primitive::<Int32Type>().values().to_vec())
            .collect::<Vec<_>>();
        assert_eq!(values, (0..input.iter().sum::<i32>()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_chunker_stops_after_error() {
        let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::Int32, false)]));
        let batch =
            RecordBatch::try_new(schema.clone(), vec![Arc::new(Int32Array::from(vec![1, 2, 3]))])
                .unwrap();
        let items = vec![
            Ok(batch.clone()),
            Err(Error::upstream("source went away", location!())),
            Ok(batch),
        ];
        let stream = Box::pin(RecordBatchStreamAdapter::new(
            schema,
            futures::stream::iter(items),
        ));

        let results = chunk_stream(stream, 4).collect::<Vec<_>>().await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::Upstream { .. })));
    }
}
