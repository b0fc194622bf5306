// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use arrow_array::{ArrayRef, RecordBatch, RecordBatchOptions};
use datafusion::common::Column;
use datafusion::physical_expr::PhysicalExpr;
use datafusion::prelude::Expr;
use arrow_schema::{Schema as ArrowSchema, SchemaRef};
use arrow_select::concat::concat_batches;
use arrow_select::filter::filter_record_batch;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::TryStreamExt;
use pin_project::pin_project;
use snafu::location;
use tracing::{info_span, instrument, Span};

use tessera_core::datatypes::Schema;
use tessera_core::stream::{RecordBatchStream, RecordBatchStreamAdapter, SendableRecordBatchStream};
use tessera_file::FileReader;
use tessera_table::format::Fragment;
use tessera_table::io::deletion::read_deletion_file;

use super::fragment::FileFragment;
use super::Dataset;
use crate::io::exec::{evaluate_predicate, Planner};
use crate::{Error, Result};

/// Number of fragments read concurrently by a scan.
const FRAGMENT_READAHEAD: usize = 4;

/// Reads a dataset, or some of its fragments, as a stream of batches.
///
/// ```rust,ignore
/// let mut scanner = dataset.scan();
/// scanner.project(&["ts", "payload.kind"])?.limit(Some(10), None)?;
/// let batches = scanner.try_into_stream().await?.try_collect::<Vec<_>>().await?;
/// ```
#[derive(Debug, Clone)]
pub struct Scanner {
    dataset: Arc<Dataset>,

    /// Output columns, each computed by an optimized expression over the
    /// stored columns. `None` outputs every column of the dataset.
    projection: Option<Vec<(String, Expr)>>,

    /// Optimized filter expression.
    pub(crate) filter: Option<Expr>,

    limit: Option<i64>,
    offset: Option<i64>,

    /// Scan only these fragments, in this order. `None` scans the whole dataset.
    fragments: Option<Vec<Fragment>>,
}

impl Scanner {
    pub fn new(dataset: Arc<Dataset>) -> Self {
        Self {
            dataset,
            projection: None,
            filter: None,
            limit: None,
            offset: None,
            fragments: None,
        }
    }

    pub fn from_fragment(dataset: Arc<Dataset>, fragment: Fragment) -> Self {
        Self {
            fragments: Some(vec![fragment]),
            ..Self::new(dataset)
        }
    }

    /// Restrict the scan to `fragments`, read in the given order.
    pub fn with_fragments(&mut self, fragments: Vec<Fragment>) -> &mut Self {
        self.fragments = Some(fragments);
        self
    }

    fn planner(&self) -> Planner {
        Planner::new(Arc::new(ArrowSchema::from(self.dataset.schema())))
    }

    /// Output only `columns`, by name. Nested fields use dotted paths.
    pub fn project<T: AsRef<str>>(&mut self, columns: &[T]) -> Result<&mut Self> {
        let columns = columns
            .iter()
            .map(|c| (c.as_ref(), c.as_ref()))
            .collect::<Vec<_>>();
        self.project_with_transform(&columns)
    }

    /// Output computed columns.
    ///
    /// Each output column is named by the first item of the pair and computed
    /// by the SQL expression in the second, e.g. `("b_proj", "b")` or
    /// `("total", "a + b")`.
    pub fn project_with_transform(
        &mut self,
        columns: &[(impl AsRef<str>, impl AsRef<str>)],
    ) -> Result<&mut Self> {
        let planner = self.planner();
        let mut output = Vec::with_capacity(columns.len());
        for (name, expr) in columns {
            let name = name.as_ref();
            if output.iter().any(|(n, _): &(String, Expr)| n == name) {
                return Err(Error::invalid_input(
                    format!("Duplicate column name {name} in projection"),
                    location!(),
                ));
            }
            let expr = planner.parse_expr(expr.as_ref())?;
            output.push((name.to_string(), planner.optimize_expr(expr)?));
        }
        self.projection = Some(output);
        Ok(self)
    }

    /// Keep only the rows for which the SQL `WHERE` clause `filter`, such
    /// as `"a > 10 AND b < 200"`, is true. Rows where it is null are dropped.
    pub fn filter(&mut self, filter: &str) -> Result<&mut Self> {
        let planner = self.planner();
        let expr = planner.parse_filter(filter)?;
        self.filter = Some(planner.optimize_expr(expr)?);
        Ok(self)
    }

    /// Set limit and offset.
    ///
    /// The offset skips rows that pass the filter.
    pub fn limit(&mut self, limit: Option<i64>, offset: Option<i64>) -> Result<&mut Self> {
        for (name, value) in [("Limit", limit), ("Offset", offset)] {
            if value.is_some_and(|v| v < 0) {
                return Err(Error::invalid_input(
                    format!("{name} must be non-negative"),
                    location!(),
                ));
            }
        }
        self.limit = limit;
        self.offset = offset;
        Ok(self)
    }

    /// The output columns and their expressions.
    fn output_columns(&self) -> Vec<(String, Expr)> {
        match &self.projection {
            Some(projection) => projection.clone(),
            None => self
                .dataset
                .schema()
                .fields
                .iter()
                .map(|f| (f.name.clone(), Expr::Column(Column::from_name(f.name.clone()))))
                .collect(),
        }
    }

    /// The schema of the output batches.
    pub fn schema(&self) -> Result<SchemaRef> {
        let planner = self.planner();
        let fields = self
            .output_columns()
            .iter()
            .map(|(name, expr)| planner.output_field(name, expr))
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(ArrowSchema::new(fields)))
    }

    /// The stored columns a scan has to read.
    fn read_schema(&self) -> Result<Schema> {
        let mut columns: Vec<String> = Vec::new();
        let exprs = self
            .output_columns()
            .into_iter()
            .map(|(_, expr)| expr)
            .chain(self.filter.clone());
        for expr in exprs {
            for name in Planner::column_names_in_expr(&expr) {
                if !columns.contains(&name) {
                    columns.push(name);
                }
            }
        }
        if columns.is_empty() {
            // Rows still have to be counted from some column
            if let Some(first) = self.dataset.schema().fields.first() {
                columns.push(first.name.clone());
            }
        }
        self.dataset.schema().project(&columns)
    }

    fn fragments(&self) -> Vec<Fragment> {
        self.fragments
            .clone()
            .unwrap_or_else(|| self.dataset.manifest.fragments.as_ref().clone())
    }

    /// Create a stream from the Scanner.
    #[instrument(skip_all)]
    pub async fn try_into_stream(&self) -> Result<DatasetRecordBatchStream> {
        let output_schema = self.schema()?;
        let read_schema = Arc::new(self.read_schema()?);

        // Physical expressions bind columns by position in the read batches
        let planner = Planner::new(Arc::new(ArrowSchema::from(read_schema.as_ref())));
        let output_columns = self
            .output_columns()
            .iter()
            .map(|(_, expr)| planner.create_physical_expr(expr))
            .collect::<Result<Vec<_>>>()?;
        let filter = self
            .filter
            .as_ref()
            .map(|expr| planner.create_physical_expr(expr))
            .transpose()?;
        let dataset = self.dataset.clone();

        let batches = futures::stream::iter(self.fragments())
            .map(move |fragment| {
                let dataset = dataset.clone();
                let read_schema = read_schema.clone();
                async move { read_fragment(&dataset, &fragment, &read_schema, true).await }
            })
            .buffered(FRAGMENT_READAHEAD)
            .try_filter_map(move |batch| {
                let filtered = match (batch, &filter) {
                    (Some(batch), Some(filter)) => evaluate_predicate(filter.as_ref(), &batch)
                        .and_then(|mask| Ok(filter_record_batch(&batch, &mask)?))
                        .map(Some),
                    (batch, _) => Ok(batch),
                };
                futures::future::ready(filtered)
            })
            .boxed();

        let batches = apply_offset_limit(
            batches,
            self.offset.unwrap_or_default() as usize,
            self.limit.map(|l| l as usize),
        );

        let projected_schema = output_schema.clone();
        let batches = batches.map(move |batch| {
            batch.and_then(|batch| project_batch(&batch, &output_columns, &projected_schema))
        });

        Ok(DatasetRecordBatchStream::new(Box::pin(
            RecordBatchStreamAdapter::new(output_schema, batches),
        )))
    }

    /// Scan and return all rows in one [`RecordBatch`].
    pub async fn try_into_batch(&self) -> Result<RecordBatch> {
        let schema = self.schema()?;
        let batches = self
            .try_into_stream()
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        Ok(concat_batches(&schema, &batches)?)
    }

    /// Count the rows the scan would return.
    ///
    /// Without a filter, limit or offset this only reads metadata.
    #[instrument(skip_all)]
    pub async fn count_rows(&self) -> Result<u64> {
        if self.filter.is_none() && self.limit.is_none() && self.offset.is_none() {
            let mut total = 0;
            for fragment in self.fragments() {
                total += FileFragment::new(self.dataset.clone(), fragment)
                    .count_rows()
                    .await?;
            }
            return Ok(total as u64);
        }
        let mut scanner = self.clone();
        scanner.project::<&str>(&[])?;
        scanner
            .try_into_stream()
            .await?
            .try_fold(0, |acc, batch| {
                futures::future::ready(Ok(acc + batch.num_rows() as u64))
            })
            .await
    }
}

/// Read the columns of `read_schema` for every row of `fragment`.
///
/// Deleted rows are dropped when `apply_deletions` is set. Returns `None` if no
/// rows are left.
pub(crate) async fn read_fragment(
    dataset: &Dataset,
    fragment: &Fragment,
    read_schema: &Schema,
    apply_deletions: bool,
) -> Result<Option<RecordBatch>> {
    let arrow_schema = Arc::new(ArrowSchema::from(read_schema));
    let mut columns: Vec<Option<ArrayRef>> = vec![None; read_schema.fields.len()];
    let mut num_rows = None;

    for data_file in fragment.files.iter() {
        let projection = Schema {
            fields: read_schema
                .fields
                .iter()
                .filter(|f| data_file.fields.contains(&f.id))
                .cloned()
                .collect(),
            metadata: Default::default(),
        };
        if projection.is_empty() {
            continue;
        }
        let path = dataset.data_dir().child(data_file.path.as_str());
        let reader = FileReader::try_open(
            dataset.object_store(),
            &path,
            data_file.schema(dataset.schema()),
            &data_file.column_indices,
        )
        .await?;
        let batches = reader.read_all(&projection)?;
        let batch = concat_batches(&Arc::new(ArrowSchema::from(&projection)), &batches)?;

        if let Some(expected) = num_rows {
            if expected != batch.num_rows() {
                return Err(Error::corrupt_file(
                    path,
                    format!(
                        "fragment {} has {} rows but this file has {}",
                        fragment.id,
                        expected,
                        batch.num_rows()
                    ),
                    location!(),
                ));
            }
        }
        num_rows = Some(batch.num_rows());
        for (i, field) in read_schema.fields.iter().enumerate() {
            if let Some(column) = batch.column_by_name(&field.name) {
                columns[i] = Some(column.clone());
            }
        }
    }

    let columns = columns
        .into_iter()
        .zip(read_schema.fields.iter())
        .map(|(column, field)| {
            column.ok_or_else(|| {
                Error::invalid_input(
                    format!(
                        "Fragment {} does not contain field {:?}",
                        fragment.id, field.name
                    ),
                    location!(),
                )
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let batch = RecordBatch::try_new(arrow_schema, columns)?;

    let batch = if apply_deletions {
        let deletion_vector =
            read_deletion_file(&dataset.base, fragment, dataset.object_store()).await?;
        match deletion_vector.and_then(|dv| dv.build_predicate(0, batch.num_rows())) {
            Some(mask) => filter_record_batch(&batch, &mask)?,
            None => batch,
        }
    } else {
        batch
    };

    if batch.num_rows() == 0 {
        Ok(None)
    } else {
        Ok(Some(batch))
    }
}

/// Skip the first `offset` rows of `stream` and end it after `limit` rows.
fn apply_offset_limit(
    stream: BoxStream<'static, Result<RecordBatch>>,
    offset: usize,
    limit: Option<usize>,
) -> BoxStream<'static, Result<RecordBatch>> {
    futures::stream::unfold(
        (stream, offset, limit),
        |(mut stream, mut offset, mut remaining)| async move {
            loop {
                if remaining == Some(0) {
                    return None;
                }
                let mut batch = match stream.next().await? {
                    Ok(batch) => batch,
                    // Nothing is read after an error
                    Err(e) => return Some((Err(e), (stream, offset, Some(0)))),
                };
                if offset >= batch.num_rows() {
                    offset -= batch.num_rows();
                    continue;
                }
                batch = batch.slice(offset, batch.num_rows() - offset);
                offset = 0;
                if let Some(left) = remaining {
                    if batch.num_rows() > left {
                        batch = batch.slice(0, left);
                    }
                    remaining = Some(left - batch.num_rows());
                }
                return Some((Ok(batch), (stream, offset, remaining)));
            }
        },
    )
    .boxed()
}

/// Compute the output columns of a scan from the stored columns.
fn project_batch(
    batch: &RecordBatch,
    columns: &[Arc<dyn PhysicalExpr>],
    schema: &SchemaRef,
) -> Result<RecordBatch> {
    let arrays = columns
        .iter()
        .map(|expr| Ok(expr.evaluate(batch)?.into_array(batch.num_rows())?))
        .collect::<Result<Vec<ArrayRef>>>()?;
    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        schema.clone(),
        arrays,
        &options,
    )?)
}

#[pin_project]
pub struct DatasetRecordBatchStream {
    #[pin]
    exec_node: SendableRecordBatchStream,
    span: Span,
}

impl DatasetRecordBatchStream {
    pub fn new(exec_node: SendableRecordBatchStream) -> Self {
        let span = info_span!("DatasetRecordBatchStream");
        Self { exec_node, span }
    }
}

impl RecordBatchStream for DatasetRecordBatchStream {
    fn schema(&self) -> SchemaRef {
        self.exec_node.schema()
    }
}

impl Stream for DatasetRecordBatchStream {
    type Item = Result<RecordBatch>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let _guard = this.span.enter();
        this.exec_node.poll_next(cx)
    }
}

impl From<DatasetRecordBatchStream> for SendableRecordBatchStream {
    fn from(stream: DatasetRecordBatchStream) -> Self {
        stream.exec_node
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::cast::AsArray;
    use arrow_array::types::Int32Type;
    use arrow_array::{Int32Array, RecordBatchIterator, StringArray};
    use arrow_schema::{DataType, Field as ArrowField};
    use rstest::rstest;

    use super::*;
    use crate::dataset::WriteParams;

    async fn create_dataset(uri: &str) -> Dataset {
        let schema = Arc::new(ArrowSchema::new(vec![
            ArrowField::new("i", DataType::Int32, true),
            ArrowField::new("s", DataType::Utf8, true),
        ]));
        let batches = (0..5)
            .map(|b| {
                RecordBatch::try_new(
                    schema.clone(),
                    vec![
                        Arc::new(Int32Array::from_iter_values(b * 20..(b + 1) * 20)),
                        Arc::new(StringArray::from_iter_values(
                            (b * 20..(b + 1) * 20).map(|v| format!("s-{v}")),
                        )),
                    ],
                )
            })
            .collect::<Vec<_>>();
        let params = WriteParams {
            max_rows_per_file: 40,
            max_rows_per_group: 10,
            ..Default::default()
        };
        Dataset::write(
            RecordBatchIterator::new(batches, schema),
            uri,
            Some(params),
        )
        .await
        .unwrap()
    }

    fn int_values(batch: &RecordBatch, name: &str) -> Vec<i32> {
        batch[name]
            .as_primitive::<Int32Type>()
            .values()
            .to_vec()
    }

    #[tokio::test]
    async fn test_filter_and_project() {
        let test_dir = tempfile::tempdir().unwrap();
        let dataset = create_dataset(test_dir.path().to_str().unwrap()).await;

        let mut scan = dataset.scan();
        scan.filter("i % 10 = 3 AND s != 's-33'")
            .unwrap()
            .project_with_transform(&[("twice", "i * 2"), ("label", "s")])
            .unwrap();
        let batch = scan.try_into_batch().await.unwrap();
        assert_eq!(
            batch.schema().fields().iter().map(|f| f.name().as_str()).collect::<Vec<_>>(),
            vec!["twice", "label"]
        );
        let twice = batch["twice"]
            .as_primitive::<arrow_array::types::Int64Type>()
            .values()
            .to_vec();
        assert_eq!(twice, vec![6, 26, 46, 86, 106, 126, 146, 166, 186]);
        assert_eq!(batch["label"].as_string::<i32>().value(0), "s-3");
        assert_eq!(scan.count_rows().await.unwrap(), 9);
    }

    #[rstest]
    #[case(None, Some(0), 0, 100)]
    #[case(Some(10), None, 0, 10)]
    #[case(Some(15), Some(35), 35, 15)]
    #[case(None, Some(95), 95, 5)]
    #[case(Some(10), Some(200), 0, 0)]
    #[case(Some(0), None, 0, 0)]
    #[tokio::test]
    async fn test_limit_offset(
        #[case] limit: Option<i64>,
        #[case] offset: Option<i64>,
        #[case] first: i32,
        #[case] expected_rows: usize,
    ) {
        let test_dir = tempfile::tempdir().unwrap();
        let dataset = create_dataset(test_dir.path().to_str().unwrap()).await;

        let mut scan = dataset.scan();
        scan.project(&["i"]).unwrap().limit(limit, offset).unwrap();
        let batch = scan.try_into_batch().await.unwrap();
        assert_eq!(batch.num_rows(), expected_rows);
        if expected_rows > 0 {
            let values = int_values(&batch, "i");
            assert_eq!(values[0], first);
            assert_eq!(
                values,
                (first..first + expected_rows as i32).collect::<Vec<_>>()
            );
        }
        assert_eq!(scan.count_rows().await.unwrap(), expected_rows as u64);
    }

    #[tokio::test]
    async fn test_invalid_scan_options() {
        let test_dir = tempfile::tempdir().unwrap();
        let dataset = create_dataset(test_dir.path().to_str().unwrap()).await;

        let mut scan = dataset.scan();
        assert!(scan.limit(Some(-1), None).is_err());
        assert!(scan.limit(None, Some(-1)).is_err());
        assert!(matches!(
            scan.filter("missing = 1"),
            Err(Error::InvalidInput { .. })
        ));
        assert!(scan.project(&["missing"]).is_err());
        assert!(scan
            .project_with_transform(&[("x", "i"), ("x", "s")])
            .is_err());
    }

    #[tokio::test]
    async fn test_scan_single_fragment() {
        let test_dir = tempfile::tempdir().unwrap();
        let dataset = create_dataset(test_dir.path().to_str().unwrap()).await;

        let fragment = dataset.get_fragment(1).unwrap();
        let batch = fragment.scan().try_into_batch().await.unwrap();
        assert_eq!(
            int_values(&batch, "i"),
            (40..80).collect::<Vec<_>>()
        );

        let stream = fragment.scan().try_into_stream().await.unwrap();
        assert_eq!(stream.schema().fields().len(), 2);
        let batches = stream.try_collect::<Vec<_>>().await.unwrap();
        assert_eq!(batches.len(), 1);
    }

    #[tokio::test]
    async fn test_project_empty() {
        let test_dir = tempfile::tempdir().unwrap();
        let dataset = create_dataset(test_dir.path().to_str().unwrap()).await;

        let mut scan = dataset.scan();
        scan.project::<&str>(&[]).unwrap().filter("i < 7").unwrap();
        let batch = scan.try_into_batch().await.unwrap();
        assert_eq!(batch.num_columns(), 0);
        assert_eq!(batch.num_rows(), 7);
    }
}
