//! Fixtures shared by the unit tests

use crate::{config::RunnerConfig, job::Program, run_info::RunInfo};
use std::{fs, path::Path};

pub const ORCA_SUCCESS: &str = "\
                                 *****************
                                 * O   R   C   A *
                                 *****************
FINAL SINGLE POINT ENERGY      -76.326558
                             ****ORCA TERMINATED NORMALLY****
";

pub const ORCA_FAILURE: &str = "\
                                 * O   R   C   A *
                           SCF NOT CONVERGED AFTER 125 CYCLES
";

pub const ORCA_IMAGINARY: &str = "\
                       *        Geometry Optimization Run        *
                    ***        THE OPTIMIZATION HAS CONVERGED     ***
                             *** OPTIMIZATION RUN DONE ***
   6:      -45.12 cm**-1 ***imaginary mode***
                             ****ORCA TERMINATED NORMALLY****
";

pub const XYZ: &str = "\
3
water
O      0.000000    0.000000    0.117300
H      0.000000    0.757200   -0.469200
H      0.000000   -0.757200   -0.469200
";

/// Defaults without any sleeping
pub fn config() -> RunnerConfig {
    let mut config = RunnerConfig::default();
    config.max_jobs = 2;
    config.tick_interval_ms = 0;
    config.scheduler.retries = 3;
    config.scheduler.backoff_ms = 0;
    config.harness.missing_output_retries = 1;
    config.harness.missing_output_delay_ms = 0;
    config
}

/// Create `directory` with an ORCA input referencing `start.xyz` and a submit script
pub fn orca_job(directory: &Path, basename: &str) {
    fs::create_dir_all(directory).unwrap();
    fs::write(
        directory.join(format!("{basename}.inp")),
        "! B3LYP def2-SVP Opt\n%pal nprocs 4 end\n* xyzfile 0 1 start.xyz\n",
    )
    .unwrap();
    fs::write(
        directory.join(format!("{basename}.sh")),
        format!("#!/bin/bash\n#SBATCH -n 4\n#SBATCH --time=1-00:00:00\n#SBATCH --mem-per-cpu=2000\norca {basename}.inp > {basename}.out\n"),
    )
    .unwrap();
}

/// Write the run info a succeeded ORCA job leaves behind, plus its artifact
pub fn succeeded_orca(directory: &Path, basename: &str) {
    orca_job(directory, basename);
    fs::write(directory.join(format!("{basename}.out")), ORCA_SUCCESS).unwrap();
    fs::write(directory.join(format!("{basename}.xyz")), XYZ).unwrap();
    RunInfo {
        basename: basename.to_owned(),
        program: Program::Orca,
        status: crate::job::Status::Succeeded,
        external_id: 42,
        ruleset: "builtin:orca".to_owned(),
        parse_failures: 0,
        vanished_polls: 0,
        host: None,
    }
    .write(directory)
    .unwrap();
}
