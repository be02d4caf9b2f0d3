pub mod filings;
pub mod search;

pub use filings::FilingCollector;
pub use search::SearchCollector;
