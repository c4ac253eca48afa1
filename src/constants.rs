//! Global constants for iofwd

/// Thread name prefix of each rank in a single-process session
pub const RANK_THREAD_PREFIX: &str = "rank";

/// Path of the dataset written by the synthetic workload
pub const DEFAULT_DATASET_PATH: &str = "/iofwd/field.nc";

/// Create mode passed to the backend by the synthetic workload
pub const DEFAULT_CREATE_MODE: i32 = 0;

/// Columns of each client's tile in the synthetic workload
pub const WORKLOAD_TILE_X: usize = 8;

/// Rows of each client's tile in the synthetic workload
pub const WORKLOAD_TILE_Y: usize = 8;

/// Thread name of `rank`.
pub fn rank_thread_name(rank: usize) -> String {
    format!("{}-{}", RANK_THREAD_PREFIX, rank)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_thread_name() {
        assert_eq!(rank_thread_name(12), "rank-12");
    }
}
