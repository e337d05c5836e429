pub mod postgres;

pub use postgres::{LoadReport, PostgresLoader, StageCount};
