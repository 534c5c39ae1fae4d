//! Chart, dimension and variable declarations
//!
//! Modules declare charts up front through [`Module::charts`](super::Module::charts)
//! and may add more during collection through the [`Charts`] handle. The job
//! runner diffs this collection against what the parent already knows.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChartError {
    #[error("chart '{0}' already exists")]
    DuplicateChart(String),

    #[error("chart '{chart}' already has dimension '{dim}'")]
    DuplicateDim { chart: String, dim: String },

    #[error("invalid identifier '{0}'")]
    InvalidId(String),

    #[error("unknown chart '{0}'")]
    UnknownChart(String),
}

/// Chart rendering type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChartType {
    #[default]
    Line,
    Area,
    Stacked,
}

impl ChartType {
    /// Numeric code written in CHART lines
    pub fn code(&self) -> u8 {
        match self {
            ChartType::Line => 0,
            ChartType::Area => 1,
            ChartType::Stacked => 2,
        }
    }
}

/// How the parent turns collected values into stored values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DimAlgorithm {
    #[default]
    Absolute,
    Incremental,
    PercentageOfAbsoluteRow,
    PercentageOfIncrementalRow,
}

impl DimAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DimAlgorithm::Absolute => "absolute",
            DimAlgorithm::Incremental => "incremental",
            DimAlgorithm::PercentageOfAbsoluteRow => "percentage-of-absolute-row",
            DimAlgorithm::PercentageOfIncrementalRow => "percentage-of-incremental-row",
        }
    }
}

/// A dimension: one series of a chart.
///
/// `id` is what the parent sees and is unique within the chart; `key` is
/// where the value lives in the job's metric bag and defaults to the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dim {
    pub id: String,
    pub key: String,
    pub name: String,
    pub algorithm: DimAlgorithm,
    pub multiplier: i64,
    pub divisor: i64,
    pub hidden: bool,
}

impl Dim {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            key: id.clone(),
            id,
            algorithm: DimAlgorithm::Absolute,
            multiplier: 1,
            divisor: 1,
            hidden: false,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn algorithm(mut self, algorithm: DimAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn incremental(self) -> Self {
        self.algorithm(DimAlgorithm::Incremental)
    }

    pub fn mul(mut self, multiplier: i64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn div(mut self, divisor: i64) -> Self {
        self.divisor = divisor;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Whether the parent would interpret values differently
    pub(crate) fn semantics_differ(&self, other: &Dim) -> bool {
        self.algorithm != other.algorithm
            || self.multiplier != other.multiplier
            || self.divisor != other.divisor
    }
}

/// A chart-scoped variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Var {
    pub id: String,
    pub value: i64,
}

impl Var {
    pub fn new(id: impl Into<String>, value: i64) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

/// Chart flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChartOpts {
    pub obsolete: bool,
    pub detail: bool,
    pub store_first: bool,
    pub hidden: bool,
}

impl ChartOpts {
    /// Space separated flag list as written in CHART lines
    pub fn flags(&self) -> String {
        let mut flags = Vec::new();
        if self.obsolete {
            flags.push("obsolete");
        }
        if self.detail {
            flags.push("detail");
        }
        if self.store_first {
            flags.push("store_first");
        }
        if self.hidden {
            flags.push("hidden");
        }
        flags.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chart {
    pub id: String,
    pub title: String,
    pub units: String,
    pub family: String,
    pub context: String,
    pub chart_type: ChartType,
    /// `None` defers to the job's priority
    pub priority: Option<i64>,
    /// Per-chart override of the job update interval, in seconds
    pub update_every: Option<u64>,
    pub opts: ChartOpts,
    dims: Vec<Dim>,
    vars: Vec<Var>,
}

impl Chart {
    pub fn new(id: impl Into<String>, title: impl Into<String>, units: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            units: units.into(),
            family: String::new(),
            context: String::new(),
            chart_type: ChartType::Line,
            priority: None,
            update_every: None,
            opts: ChartOpts::default(),
            dims: Vec::new(),
            vars: Vec::new(),
        }
    }

    pub fn family(mut self, family: impl Into<String>) -> Self {
        self.family = family.into();
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn chart_type(mut self, chart_type: ChartType) -> Self {
        self.chart_type = chart_type;
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn update_every(mut self, secs: u64) -> Self {
        self.update_every = Some(secs);
        self
    }

    pub fn detail(mut self) -> Self {
        self.opts.detail = true;
        self
    }

    /// Declaration-time dimension; uniqueness is enforced by [`Charts::add`]
    pub fn with_dim(mut self, dim: Dim) -> Self {
        self.dims.push(dim);
        self
    }

    pub fn with_var(mut self, var: Var) -> Self {
        self.vars.push(var);
        self
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn dim(&self, id: &str) -> Option<&Dim> {
        self.dims.iter().find(|d| d.id == id)
    }

    pub fn has_dim(&self, id: &str) -> bool {
        self.dim(id).is_some()
    }

    /// Add a dimension to an existing chart
    pub fn add_dim(&mut self, dim: Dim) -> Result<(), ChartError> {
        validate_id(&dim.id)?;
        if self.has_dim(&dim.id) {
            return Err(ChartError::DuplicateDim {
                chart: self.id.clone(),
                dim: dim.id,
            });
        }
        self.dims.push(dim);
        Ok(())
    }

    pub fn mark_obsolete(&mut self) {
        self.opts.obsolete = true;
    }

    pub fn is_obsolete(&self) -> bool {
        self.opts.obsolete
    }

    fn validate(&self) -> Result<(), ChartError> {
        validate_id(&self.id)?;
        if self.id.contains('.') {
            return Err(ChartError::InvalidId(self.id.clone()));
        }
        for (i, dim) in self.dims.iter().enumerate() {
            validate_id(&dim.id)?;
            if self.dims[..i].iter().any(|d| d.id == dim.id) {
                return Err(ChartError::DuplicateDim {
                    chart: self.id.clone(),
                    dim: dim.id.clone(),
                });
            }
        }
        for var in &self.vars {
            validate_id(&var.id)?;
        }
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<(), ChartError> {
    if id.is_empty() || id.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
        return Err(ChartError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Ordered chart collection of one job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Charts {
    charts: Vec<Chart>,
}

impl Charts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a chart.
    ///
    /// Re-adding the id of a chart marked obsolete replaces it, which is how
    /// a module brings an obsoleted chart back.
    pub fn add(&mut self, chart: Chart) -> Result<(), ChartError> {
        chart.validate()?;
        match self.charts.iter().position(|c| c.id == chart.id) {
            Some(pos) if self.charts[pos].is_obsolete() => {
                self.charts[pos] = chart;
                Ok(())
            }
            Some(_) => Err(ChartError::DuplicateChart(chart.id)),
            None => {
                self.charts.push(chart);
                Ok(())
            }
        }
    }

    pub fn add_all(&mut self, charts: impl IntoIterator<Item = Chart>) -> Result<(), ChartError> {
        for chart in charts {
            self.add(chart)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Chart> {
        self.charts.iter().find(|c| c.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Chart> {
        self.charts.iter_mut().find(|c| c.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Mark a chart obsolete; the runner tells the parent and drops it
    pub fn mark_obsolete(&mut self, id: &str) -> Result<(), ChartError> {
        self.get_mut(id)
            .map(Chart::mark_obsolete)
            .ok_or_else(|| ChartError::UnknownChart(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chart> {
        self.charts.iter()
    }

    pub fn len(&self) -> usize {
        self.charts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.charts.is_empty()
    }

    pub(crate) fn remove_obsolete(&mut self) {
        self.charts.retain(|c| !c.is_obsolete());
    }
}

impl FromIterator<Chart> for Charts {
    /// Collect without validation; invalid charts surface when added to a job
    fn from_iter<I: IntoIterator<Item = Chart>>(iter: I) -> Self {
        Self {
            charts: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Charts {
    type Item = Chart;
    type IntoIter = std::vec::IntoIter<Chart>;

    fn into_iter(self) -> Self::IntoIter {
        self.charts.into_iter()
    }
}
