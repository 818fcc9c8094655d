use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use fleet::{ExperimentConfig, Results};

/// One experiment's summary, as seen by the leader.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub qp_sched_pol: String,
    pub compute_nodes: u64,
    pub memory_nodes: u64,
    pub cn_threads: u64,
    pub cn_ops_per_thread: u64,
    pub capacity: u64,
    pub payload_size: u64,
    pub ops: u64,
    pub throughput: f64,
    pub mean_ns: f64,
    pub p50_ns: u64,
    pub p99_ns: u64,
    pub p999_ns: u64,
    pub max_ns: u64,
    pub elapsed_ns: u64,
}

impl ResultRow {
    pub fn new(config: &ExperimentConfig, results: &Results) -> Self {
        Self {
            qp_sched_pol: config.qp_sched_pol.clone(),
            compute_nodes: config.last_cn_id - config.first_cn_id + 1,
            memory_nodes: config.memory_node_count(),
            cn_threads: config.cn_threads,
            cn_ops_per_thread: config.cn_ops_per_thread,
            capacity: config.capacity,
            payload_size: config.payload_size,
            ops: results.ops,
            throughput: results.throughput,
            mean_ns: results.mean_ns,
            p50_ns: results.p50_ns,
            p99_ns: results.p99_ns,
            p999_ns: results.p999_ns,
            max_ns: results.max_ns,
            elapsed_ns: results.elapsed_ns,
        }
    }
}

fn u64_column(rows: &[ResultRow], f: impl Fn(&ResultRow) -> u64) -> ArrayRef {
    Arc::new(UInt64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
}

fn f64_column(rows: &[ResultRow], f: impl Fn(&ResultRow) -> f64) -> ArrayRef {
    Arc::new(Float64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
}

pub fn write_parquet(
    path: impl AsRef<Path>,
    rows: &[ResultRow],
) -> Result<(), Box<dyn std::error::Error>> {
    if rows.is_empty() {
        return Ok(());
    }

    let u64_field = |name: &str| Field::new(name, DataType::UInt64, false);
    let schema = Arc::new(Schema::new(vec![
        Field::new("qp_sched_pol", DataType::Utf8, false),
        u64_field("compute_nodes"),
        u64_field("memory_nodes"),
        u64_field("cn_threads"),
        u64_field("cn_ops_per_thread"),
        u64_field("capacity"),
        u64_field("payload_size"),
        u64_field("ops"),
        Field::new("throughput", DataType::Float64, false),
        Field::new("mean_ns", DataType::Float64, false),
        u64_field("p50_ns"),
        u64_field("p99_ns"),
        u64_field("p999_ns"),
        u64_field("max_ns"),
        u64_field("elapsed_ns"),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.qp_sched_pol.as_str()).collect::<Vec<_>>(),
            )) as ArrayRef,
            u64_column(rows, |r| r.compute_nodes),
            u64_column(rows, |r| r.memory_nodes),
            u64_column(rows, |r| r.cn_threads),
            u64_column(rows, |r| r.cn_ops_per_thread),
            u64_column(rows, |r| r.capacity),
            u64_column(rows, |r| r.payload_size),
            u64_column(rows, |r| r.ops),
            f64_column(rows, |r| r.throughput),
            f64_column(rows, |r| r.mean_ns),
            u64_column(rows, |r| r.p50_ns),
            u64_column(rows, |r| r.p99_ns),
            u64_column(rows, |r| r.p999_ns),
            u64_column(rows, |r| r.max_ns),
            u64_column(rows, |r| r.elapsed_ns),
        ],
    )?;

    let file = std::fs::File::create(path)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet::Metrics;

    fn row() -> ResultRow {
        let mut m = Metrics::new();
        for ns in [100, 200, 400] {
            m.record_ns(ns);
        }
        m.set_elapsed(std::time::Duration::from_micros(10));
        ResultRow::new(&ExperimentConfig::default(), &Results::calc(&m))
    }

    #[test]
    fn test_row_from_results() {
        let r = row();
        assert_eq!(r.ops, 3);
        assert_eq!(r.compute_nodes, 1);
        assert_eq!(r.memory_nodes, 1);
        assert_eq!(r.qp_sched_pol, "ONE_TO_ONE");
        assert_eq!(r.max_ns, 400);
    }

    #[test]
    fn test_write_parquet_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.parquet");
        write_parquet(&path, &[row(), row()]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"PAR1");
        assert_eq!(&bytes[bytes.len() - 4..], b"PAR1");
    }

    #[test]
    fn test_no_rows_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.parquet");
        write_parquet(&path, &[]).unwrap();
        assert!(!path.exists());
    }
}
