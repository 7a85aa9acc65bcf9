use std::path::PathBuf;

use anyhow::{bail, Result};

use poc_spec::PLOT_SIZE;

use crate::plotter::task::WriterTask;

/// The files one drive will receive, in generation order.
#[derive(Debug)]
pub struct DrivePlan {
    pub driver: PathBuf,
    pub tasks: Vec<WriterTask>,
}

/// Split `[start_nonce, start_nonce + total_nonces)` into plot files across
/// the drives: drives are filled in enumeration order, each up to its fair
/// ceil-share of the file count.
pub fn plan_drives(
    plot_id: u64,
    start_nonce: u64,
    total_nonces: u64,
    max_weight_bytes: u64,
    drivers: &[PathBuf],
) -> Result<Vec<DrivePlan>> {
    if drivers.is_empty() {
        bail!("no output drive (directory) specified");
    }
    if total_nonces == 0 {
        bail!("nothing to plot: total nonce count is zero");
    }
    if start_nonce.checked_add(total_nonces).is_none() {
        bail!("nonce range [{start_nonce}, {start_nonce} + {total_nonces}) overflows");
    }
    let max_nonces_per_file = max_weight_bytes / PLOT_SIZE as u64;
    if max_nonces_per_file == 0 {
        bail!("file weight of {max_weight_bytes} bytes does not fit a single nonce");
    }

    let total_files = total_nonces.div_ceil(max_nonces_per_file);
    let max_files_per_driver = total_files.div_ceil(drivers.len() as u64);

    let mut sn_to_gen = start_nonce;
    let mut nonces_to_gen = total_nonces;
    let mut plans = Vec::with_capacity(drivers.len());
    for driver in drivers {
        let mut tasks = Vec::new();
        for _ in 0..max_files_per_driver {
            if nonces_to_gen == 0 {
                break;
            }
            let nonces = nonces_to_gen.min(max_nonces_per_file);
            tasks.push(WriterTask {
                plot_id,
                init_sn: sn_to_gen,
                init_nonces: nonces,
                driver: driver.clone(),
            });
            sn_to_gen += nonces;
            nonces_to_gen -= nonces;
        }
        plans.push(DrivePlan {
            driver: driver.clone(),
            tasks,
        });
    }

    debug_assert_eq!(nonces_to_gen, 0);
    Ok(plans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    fn coverage(plans: &[DrivePlan]) -> Vec<(u64, u64)> {
        plans
            .iter()
            .flat_map(|p| p.tasks.iter())
            .map(|t| (t.init_sn, t.init_nonces))
            .collect()
    }

    #[test]
    fn single_tiny_plot_fits_one_file() {
        let weight = 16 * PLOT_SIZE as u64;
        let plans = plan_drives(1, 0, 16, weight, &dirs(&["/tmp/a"])).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(coverage(&plans), vec![(0, 16)]);
    }

    #[test]
    fn uneven_split_covers_the_range_without_overlap() {
        let weight = 32 * PLOT_SIZE as u64;
        let plans = plan_drives(42, 1000, 48, weight, &dirs(&["/tmp/a", "/tmp/b"])).unwrap();
        assert_eq!(plans[0].tasks.len(), 1);
        assert_eq!(plans[1].tasks.len(), 1);
        assert_eq!(coverage(&plans), vec![(1000, 32), (1032, 16)]);
        assert_eq!(
            plans[1].tasks[0].plot_file(),
            PathBuf::from("/tmp/b/42_1032_16")
        );
    }

    #[test]
    fn drives_fill_in_order_up_to_their_share() {
        // 5 files over 2 drives: ceil share of 3, so 3 on the first drive.
        let weight = 10 * PLOT_SIZE as u64;
        let plans = plan_drives(9, 0, 50, weight, &dirs(&["/d0", "/d1"])).unwrap();
        assert_eq!(plans[0].tasks.len(), 3);
        assert_eq!(plans[1].tasks.len(), 2);
        let ranges = coverage(&plans);
        assert_eq!(ranges, vec![(0, 10), (10, 10), (20, 10), (30, 10), (40, 10)]);
    }

    #[test]
    fn ranges_are_contiguous_for_arbitrary_shapes() {
        let weight = 7 * PLOT_SIZE as u64;
        let plans = plan_drives(3, 12345, 61, weight, &dirs(&["/a", "/b", "/c"])).unwrap();
        let mut next = 12345u64;
        let mut total = 0u64;
        for (sn, nonces) in coverage(&plans) {
            assert_eq!(sn, next, "ranges must be contiguous and ordered");
            next += nonces;
            total += nonces;
        }
        assert_eq!(total, 61);
    }

    #[test]
    fn configuration_errors_fail_fast() {
        let weight = 32 * PLOT_SIZE as u64;
        assert!(plan_drives(1, 0, 16, weight, &[]).is_err());
        assert!(plan_drives(1, 0, 0, weight, &dirs(&["/a"])).is_err());
        assert!(plan_drives(1, 0, 16, PLOT_SIZE as u64 - 1, &dirs(&["/a"])).is_err());
        assert!(plan_drives(1, u64::MAX - 3, 16, weight, &dirs(&["/a"])).is_err());
    }
}
