pub mod calculator;
pub mod loader;
pub mod models;
pub mod service;

pub use calculator::CostCalculator;
pub use loader::{load_pricing_file, parse_pricing_toml, PricingDataFile};
pub use models::{round_cost, CostBreakdown, ModelPrice, PricingMissPolicy, PricingSource};
pub use service::PricingService;
