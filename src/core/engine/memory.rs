use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use super::{ExecutionHandle, QueryEngine, QueryRequest};
use crate::core::channel::ResultChannel;

static CREATE_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^\s*CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(\w+)\s*\((.*)\)\s*(?:ENGINE\s*=\s*(\w+))?\s*;?\s*$",
    )
    .expect("static regex")
});
static DROP_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*DROP\s+TABLE\s+(IF\s+EXISTS\s+)?(\w+)\s*;?\s*$").expect("static regex")
});
static INSERT_VALUES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*INSERT\s+INTO\s+(\w+)\s+VALUES\s*(.*?)\s*;?\s*$").expect("static regex")
});
static INSERT_TSV: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*INSERT\s+INTO\s+(\w+)\s+FORMAT\s+TabSeparated(?:\s+(.*))?$")
        .expect("static regex")
});
static TUPLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^)]*)\)").expect("static regex"));
static SELECT_NUMBERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*SELECT\s+(.+?)\s+FROM\s+numbers\(\s*(\d+)\s*\)\s*;?\s*$")
        .expect("static regex")
});
static SELECT_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*SELECT\s+(.+?)\s+FROM\s+(\w+)(?:\s+ORDER\s+BY\s+(\w+))?\s*;?\s*$")
        .expect("static regex")
});
static SELECT_LITERALS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*SELECT\s+(.+?)\s*;?\s*$").expect("static regex"));

type Row = Vec<String>;

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

/// Rows produced by a statement. `numbers(N)` is never materialized; its
/// blocks are generated as they are streamed.
#[derive(Debug)]
enum Output {
    Rows(Vec<Row>),
    Numbers(u64),
}

impl Output {
    fn len(&self) -> u64 {
        match self {
            Output::Rows(rows) => rows.len() as u64,
            Output::Numbers(count) => *count,
        }
    }

    /// Rows `start..end` as TabSeparated text.
    fn block(&self, start: u64, end: u64) -> String {
        match self {
            Output::Rows(rows) => rows[start as usize..end as usize]
                .iter()
                .map(|row| row.join("\t"))
                .collect::<Vec<_>>()
                .join("\n"),
            Output::Numbers(_) => (start..end)
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Small in-process engine backing the server by default.
///
/// Understands a handful of statements over in-memory tables and
/// `numbers(N)`. Output is TabSeparated and split into blocks of
/// `max_block_size` rows: every block but the last is pushed as progress,
/// the last one is the terminal payload.
pub struct MemoryEngine {
    tables: Arc<Mutex<HashMap<String, Table>>>,
    max_block_size: usize,
}

impl MemoryEngine {
    pub fn new(max_block_size: usize) -> Self {
        Self {
            tables: Arc::new(Mutex::new(HashMap::new())),
            max_block_size: max_block_size.max(1),
        }
    }

    fn block_size(&self, request: &QueryRequest) -> Result<usize> {
        match request.setting("max_block_size") {
            Some(value) => {
                let size: usize = value
                    .parse()
                    .map_err(|_| anyhow!("Invalid value for max_block_size: {value}"))?;
                if size == 0 {
                    bail!("max_block_size must be positive");
                }
                Ok(size)
            }
            None => Ok(self.max_block_size),
        }
    }
}

impl QueryEngine for MemoryEngine {
    fn submit(&self, request: &QueryRequest) -> Result<ExecutionHandle> {
        if !matches!(request.format.as_str(), "TabSeparated" | "TSV") {
            bail!("Unknown output format: {}", request.format);
        }
        let block_size = self.block_size(request)?;
        let tables = self.tables.clone();
        let query = request.query.clone();
        let delay = request.interactive_delay;
        let span = info_span!("memory_query", query_id = %request.query_id);

        Ok(ExecutionHandle::spawn(move |channel, cancel| {
            async move {
                let output = execute(&tables, &query)?;
                debug!(rows = output.len(), "Statement executed");
                stream_blocks(&channel, &cancel, output, block_size, delay).await
            }
            .instrument(span)
        }))
    }
}

/// Push every block but the last as progress and return the last one.
async fn stream_blocks(
    channel: &ResultChannel,
    cancel: &CancellationToken,
    output: Output,
    block_size: usize,
    delay: Option<Duration>,
) -> Result<String> {
    let total = output.len();
    let block_size = block_size as u64;
    let mut start = 0;

    while total - start > block_size {
        if cancel.is_cancelled() {
            bail!("Query was cancelled");
        }
        channel.push(output.block(start, start + block_size));
        start += block_size;

        match delay {
            Some(delay) => tokio::select! {
                _ = cancel.cancelled() => bail!("Query was cancelled"),
                _ = tokio::time::sleep(delay) => {}
            },
            None => tokio::task::yield_now().await,
        }
    }

    if cancel.is_cancelled() {
        bail!("Query was cancelled");
    }
    Ok(output.block(start, total))
}

fn execute(tables: &Mutex<HashMap<String, Table>>, query: &str) -> Result<Output> {
    let mut tables = tables.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(caps) = CREATE_TABLE.captures(query) {
        let name = caps[1].to_string();
        if let Some(engine) = caps.get(3) {
            if !engine.as_str().eq_ignore_ascii_case("Memory") {
                bail!("Unknown table engine {}", engine.as_str());
            }
        }
        if tables.contains_key(&name) {
            bail!("Table default.{name} already exists");
        }
        let columns: Vec<String> = caps[2]
            .split(',')
            .filter_map(|column| column.split_whitespace().next())
            .map(str::to_string)
            .collect();
        if columns.is_empty() {
            bail!("Table default.{name} must have at least one column");
        }
        tables.insert(
            name,
            Table {
                columns,
                rows: Vec::new(),
            },
        );
        return Ok(Output::Rows(Vec::new()));
    }

    if let Some(caps) = DROP_TABLE.captures(query) {
        let name = &caps[2];
        if tables.remove(name).is_none() && caps.get(1).is_none() {
            bail!("Table default.{name} doesn't exist");
        }
        return Ok(Output::Rows(Vec::new()));
    }

    if let Some(caps) = INSERT_TSV.captures(query) {
        let table = table_mut(&mut tables, &caps[1])?;
        let data = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let rows: Vec<Row> = data
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.split('\t').map(str::to_string).collect())
            .collect();
        insert_rows(table, rows)?;
        return Ok(Output::Rows(Vec::new()));
    }

    if let Some(caps) = INSERT_VALUES.captures(query) {
        let table = table_mut(&mut tables, &caps[1])?;
        let rows: Vec<Row> = TUPLE
            .captures_iter(&caps[2])
            .map(|tuple| tuple[1].split(',').map(literal).collect::<Result<Row>>())
            .collect::<Result<_>>()?;
        if rows.is_empty() {
            bail!("No values to insert");
        }
        insert_rows(table, rows)?;
        return Ok(Output::Rows(Vec::new()));
    }

    if let Some(caps) = SELECT_NUMBERS.captures(query) {
        let count: u64 = caps[2].parse()?;
        return match caps[1].trim() {
            "count()" => Ok(Output::Rows(vec![vec![count.to_string()]])),
            "number" | "*" => Ok(Output::Numbers(count)),
            other => bail!("Unknown column {other} in numbers()"),
        };
    }

    if let Some(caps) = SELECT_TABLE.captures(query) {
        let name = &caps[2];
        let table = tables
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("Table default.{name} doesn't exist"))?;
        drop(tables);
        return select(table, caps[1].trim(), caps.get(3).map(|m| m.as_str())).map(Output::Rows);
    }

    if let Some(caps) = SELECT_LITERALS.captures(query) {
        let row = caps[1].split(',').map(literal).collect::<Result<Row>>()?;
        return Ok(Output::Rows(vec![row]));
    }

    bail!("Syntax error: cannot parse query: {}", query.trim())
}

fn table_mut<'a>(tables: &'a mut HashMap<String, Table>, name: &str) -> Result<&'a mut Table> {
    tables
        .get_mut(name)
        .ok_or_else(|| anyhow!("Table default.{name} doesn't exist"))
}

fn insert_rows(table: &mut Table, rows: Vec<Row>) -> Result<()> {
    let width = table.columns.len();
    if let Some(row) = rows.iter().find(|row| row.len() != width) {
        bail!("Expected {width} values per row, got {}", row.len());
    }
    table.rows.extend(rows);
    Ok(())
}

fn select(table: Table, projection: &str, order_by: Option<&str>) -> Result<Vec<Row>> {
    if projection == "count()" {
        return Ok(vec![vec![table.rows.len().to_string()]]);
    }

    let indices: Vec<usize> = if projection == "*" {
        (0..table.columns.len()).collect()
    } else {
        projection
            .split(',')
            .map(|name| column_index(&table, name.trim()))
            .collect::<Result<_>>()?
    };

    let order = order_by
        .map(|column| column_index(&table, column))
        .transpose()?;
    let mut rows = table.rows;
    if let Some(index) = order {
        rows.sort_by(|a, b| compare_values(&a[index], &b[index]));
    }

    Ok(rows
        .into_iter()
        .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
        .collect())
}

fn column_index(table: &Table, name: &str) -> Result<usize> {
    table
        .columns
        .iter()
        .position(|column| column == name)
        .ok_or_else(|| anyhow!("Missing column {name}"))
}

fn compare_values(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

fn literal(expr: &str) -> Result<String> {
    let expr = expr.trim();
    if expr.len() >= 2 && expr.starts_with('\'') && expr.ends_with('\'') {
        return Ok(expr[1..expr.len() - 1].replace("''", "'"));
    }
    if expr.parse::<i64>().is_ok() || expr.parse::<f64>().is_ok() {
        return Ok(expr.to_string());
    }
    match expr.to_ascii_uppercase().as_str() {
        "NULL" => Ok("\\N".to_string()),
        "TRUE" => Ok("1".to_string()),
        "FALSE" => Ok("0".to_string()),
        _ => bail!("Unsupported expression: {expr}"),
    }
}
