pub mod report_queries;

pub use report_queries::{list_cities, table_counts, weather_report, TableCounts, WeatherReportRow};
