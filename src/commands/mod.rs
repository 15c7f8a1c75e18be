pub mod analyze;
pub mod cache;
pub mod cctv;
pub mod vehicles;

pub use analyze::handle_analyze;
pub use cache::{handle_cache_cleanup, handle_cache_clear, handle_cache_stats};
pub use cctv::handle_cctv_nearest;
pub use vehicles::{handle_vehicles_list, handle_vehicles_update_status};
