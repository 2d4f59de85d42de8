//! Same-day power chart data

pub mod outages;
pub mod series;

pub use outages::{outage_spans, OutageSpan};
pub use series::{build_series, CategorySeries, HistorySeries, SeriesKey};
