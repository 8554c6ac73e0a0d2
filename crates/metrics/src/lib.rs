pub mod analytics;
pub mod shaper;

pub use analytics::{Analytics, ScrapeStatus};
pub use shaper::{shape_name, DeviceLabels, MetricHandle, MetricShaper, MetricSpec};
