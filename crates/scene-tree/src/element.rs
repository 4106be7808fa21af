//! Element payloads carried by leaf nodes, and the row-append merge rules for
//! the kinds that hold tabular data.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{TreeError, TreeResult};

/// Data that can grow by appending rows from a compatible batch.
pub trait Tabular: Clone {
    fn concat(&self, batch: &Self) -> TreeResult<Self>;
    fn row_count(&self) -> usize;
}

/// Row-oriented table used by the legacy add-rows path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowTable {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

impl Tabular for RowTable {
    fn concat(&self, batch: &Self) -> TreeResult<Self> {
        if self.columns.is_empty() && self.rows.is_empty() {
            return Ok(batch.clone());
        }
        if !batch.columns.is_empty() && batch.columns != self.columns {
            return Err(TreeError::SchemaMismatch(format!(
                "expected columns {:?}, got {:?}",
                self.columns, batch.columns
            )));
        }
        let width = self.columns.len();
        if let Some(row) = batch.rows.iter().find(|row| row.len() != width) {
            return Err(TreeError::SchemaMismatch(format!(
                "row has {} cells but the table has {width} columns",
                row.len()
            )));
        }
        let mut rows = Vec::with_capacity(self.rows.len() + batch.rows.len());
        rows.extend(self.rows.iter().cloned());
        rows.extend(batch.rows.iter().cloned());
        Ok(Self {
            columns: self.columns.clone(),
            rows,
        })
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(default)]
    pub values: Vec<Value>,
}

/// Column-oriented table used by the columnar add-rows path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnTable {
    #[serde(default)]
    pub columns: Vec<Column>,
}

impl Tabular for ColumnTable {
    fn concat(&self, batch: &Self) -> TreeResult<Self> {
        if self.columns.is_empty() {
            return Ok(batch.clone());
        }
        let ours = self.columns.iter().map(|c| c.name.as_str());
        let theirs = batch.columns.iter().map(|c| c.name.as_str());
        if !ours.eq(theirs) {
            return Err(TreeError::SchemaMismatch(format!(
                "column names differ: {:?} vs {:?}",
                self.columns.iter().map(|c| &c.name).collect::<Vec<_>>(),
                batch.columns.iter().map(|c| &c.name).collect::<Vec<_>>()
            )));
        }
        let batch_rows = batch.row_count();
        if batch.columns.iter().any(|c| c.values.len() != batch_rows) {
            return Err(TreeError::SchemaMismatch(
                "columns in the appended batch have different lengths".into(),
            ));
        }
        let columns = self
            .columns
            .iter()
            .zip(&batch.columns)
            .map(|(existing, extra)| {
                let mut values = existing.values.clone();
                values.extend(extra.values.iter().cloned());
                Column {
                    name: existing.name.clone(),
                    values,
                }
            })
            .collect();
        Ok(Self { columns })
    }

    fn row_count(&self) -> usize {
        self.columns.first().map(|c| c.values.len()).unwrap_or(0)
    }
}

/// A batch of rows, optionally addressed at a named chart dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedDataSet<T> {
    #[serde(default)]
    pub name: Option<String>,
    pub data: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart<T> {
    pub spec: String,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub datasets: Vec<NamedDataSet<T>>,
}

impl<T: Tabular> Chart<T> {
    /// Named batches go to the first dataset with that name, or become a new
    /// dataset. Unnamed batches go to `data`, then to the first dataset, and
    /// otherwise become `data`.
    fn add_rows(&self, batch: &NamedDataSet<T>) -> TreeResult<Self> {
        let mut chart = self.clone();
        match batch.name.as_deref() {
            Some(name) => {
                match chart
                    .datasets
                    .iter_mut()
                    .find(|dataset| dataset.name.as_deref() == Some(name))
                {
                    Some(dataset) => dataset.data = dataset.data.concat(&batch.data)?,
                    None => chart.datasets.push(batch.clone()),
                }
            }
            None => {
                if let Some(data) = chart.data.as_mut() {
                    *data = data.concat(&batch.data)?;
                } else if let Some(first) = chart.datasets.first_mut() {
                    first.data = first.data.concat(&batch.data)?;
                } else {
                    chart.data = Some(batch.data.clone());
                }
            }
        }
        Ok(chart)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertFormat {
    Error,
    Warning,
    Info,
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Element {
    Empty,
    Text {
        body: String,
    },
    Markdown {
        body: String,
    },
    Alert {
        format: AlertFormat,
        body: String,
    },
    Exception {
        type_name: String,
        message: String,
        #[serde(default)]
        stack_trace: Vec<String>,
    },
    DataFrame(RowTable),
    Table(RowTable),
    VegaLiteChart(Chart<RowTable>),
    ArrowDataFrame(ColumnTable),
    ArrowTable(ColumnTable),
    ArrowVegaLiteChart(Chart<ColumnTable>),
}

impl Element {
    pub fn kind(&self) -> &'static str {
        match self {
            Element::Empty => "empty",
            Element::Text { .. } => "text",
            Element::Markdown { .. } => "markdown",
            Element::Alert { .. } => "alert",
            Element::Exception { .. } => "exception",
            Element::DataFrame(_) => "data_frame",
            Element::Table(_) => "table",
            Element::VegaLiteChart(_) => "vega_lite_chart",
            Element::ArrowDataFrame(_) => "arrow_data_frame",
            Element::ArrowTable(_) => "arrow_table",
            Element::ArrowVegaLiteChart(_) => "arrow_vega_lite_chart",
        }
    }

    /// Placeholder shown in place of an element whose update failed.
    pub fn error_alert(body: impl Into<String>) -> Self {
        Element::Alert {
            format: AlertFormat::Error,
            body: body.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Element::Alert {
                format: AlertFormat::Error,
                ..
            } | Element::Exception { .. }
        )
    }

    pub fn add_rows(&self, batch: &NamedDataSet<RowTable>) -> TreeResult<Self> {
        match self {
            Element::DataFrame(table) => Ok(Element::DataFrame(table.concat(&batch.data)?)),
            Element::Table(table) => Ok(Element::Table(table.concat(&batch.data)?)),
            Element::VegaLiteChart(chart) => Ok(Element::VegaLiteChart(chart.add_rows(batch)?)),
            other => Err(TreeError::UnsupportedAddRows { kind: other.kind() }),
        }
    }

    pub fn arrow_add_rows(&self, batch: &NamedDataSet<ColumnTable>) -> TreeResult<Self> {
        match self {
            Element::ArrowDataFrame(table) => {
                Ok(Element::ArrowDataFrame(table.concat(&batch.data)?))
            }
            Element::ArrowTable(table) => Ok(Element::ArrowTable(table.concat(&batch.data)?)),
            Element::ArrowVegaLiteChart(chart) => {
                Ok(Element::ArrowVegaLiteChart(chart.add_rows(batch)?))
            }
            other => Err(TreeError::UnsupportedAddRows { kind: other.kind() }),
        }
    }
}
