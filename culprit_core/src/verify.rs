use crate::bisector::ProbeStatus;
use crate::error::BisectError;
use crate::probe::Prober;
use crate::set_file::{BAD_SET_VAR, GOOD_SET_VAR, ScopedSetFile};
use crate::state::SearchState;
use tracing::info;

/// Checks that the oracle separates the two extremes before any bisection: with
/// every item good the test must pass, with every item bad it must fail.
pub fn verify(prober: &mut Prober<'_>, state: &mut SearchState) -> Result<(), BisectError> {
    let all = state.all_items.clone();

    info!("Resetting all items to good to verify.");
    {
        let good_set = ScopedSetFile::new(GOOD_SET_VAR, &all)?;
        let bad_set = ScopedSetFile::new(BAD_SET_VAR, &[])?;
        let env = [good_set.env_pair(), bad_set.env_pair()];
        prober.switch_to_good(state, &all, &env)?;

        let setup = prober.run_setup(&env)?;
        if setup != ProbeStatus::Good {
            return Err(BisectError::Verification(format!(
                "When reset to good, the test setup should succeed but reported {setup:?}"
            )));
        }
        let status = prober.run_test(&env)?;
        if status != ProbeStatus::Good {
            return Err(BisectError::Verification(format!(
                "When reset to good, the test should pass but reported {status:?}"
            )));
        }
    }

    info!("Resetting all items to bad to verify.");
    let good_set = ScopedSetFile::new(GOOD_SET_VAR, &[])?;
    let bad_set = ScopedSetFile::new(BAD_SET_VAR, &all)?;
    let env = [good_set.env_pair(), bad_set.env_pair()];
    prober.switch_to_bad(state, &all, &env)?;

    // A setup failure already reproduces the problem.
    let status = match prober.run_setup(&env)? {
        ProbeStatus::Good => prober.run_test(&env)?,
        setup => setup,
    };
    if status != ProbeStatus::Bad {
        return Err(BisectError::Verification(format!(
            "When reset to bad, the test should fail but reported {status:?}"
        )));
    }
    info!("Verification passed.");
    Ok(())
}
