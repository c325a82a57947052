//! Millicore reservation quantities and the calculator that derives them.
//!
//! All arithmetic is exact decimal arithmetic (`bigdecimal`), rounded to
//! [`DECIMAL_PRECISION`] significant digits only when a result would exceed it.
//! Floating point never enters the accumulation: core counts are converted to
//! decimal through their shortest round-trip text form first.

use core::str::FromStr;

use bigdecimal::{BigDecimal, Signed, ToPrimitive, Zero};
use tracing::trace;

use crate::error::{DomainError, DomainResult};
use crate::job::JobDescription;

/// Reservation units (millicores) per declared CPU core.
pub const MILLICORES_PER_CORE: i64 = 1000;

/// Significant digits kept by every multiplication and addition.
pub const DECIMAL_PRECISION: u64 = 15;

/// A non-negative, exact number of reserved millicores.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReservationQuantity(BigDecimal);

impl ReservationQuantity {
    pub fn zero() -> Self {
        Self(BigDecimal::zero())
    }

    /// Wrap an exact decimal. Negative values are rejected.
    pub fn from_decimal(value: BigDecimal) -> DomainResult<Self> {
        if value.is_negative() {
            return Err(DomainError::validation(format!(
                "reservation must be non-negative, got {value}"
            )));
        }
        Ok(Self(value))
    }

    /// Convert a configured float (e.g. the per-step default) into an exact decimal.
    pub fn from_f64(value: f64) -> DomainResult<Self> {
        Self::from_decimal(decimal_from_f64(value).map_err(DomainError::Validation)?)
    }

    pub fn as_decimal(&self) -> &BigDecimal {
        &self.0
    }

    pub fn into_decimal(self) -> BigDecimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Narrow to whole millicores by truncating toward zero.
    ///
    /// The storage column is an integer; fractional millicores are dropped, never
    /// rounded up. Returns `None` when the whole part does not fit in an `i64`.
    pub fn truncated_millicores(&self) -> Option<i64> {
        self.0.with_scale(0).to_i64()
    }
}

impl core::fmt::Display for ReservationQuantity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ReservationQuantity {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = BigDecimal::from_str(s)
            .map_err(|e| DomainError::validation(format!("invalid reservation {s:?}: {e}")))?;
        Self::from_decimal(value)
    }
}

/// Derives a job's reservation from its steps.
///
/// Steps that declare a positive core count contribute `cores × 1000`; all other
/// steps contribute the configured default. Contributions are summed.
#[derive(Debug, Clone)]
pub struct ReservationCalculator {
    default_per_step: ReservationQuantity,
}

impl ReservationCalculator {
    pub fn new(default_per_step: ReservationQuantity) -> Self {
        Self { default_per_step }
    }

    /// Build a calculator from a float default such as `4000.0`.
    pub fn with_default_millicores(default_per_step: f64) -> DomainResult<Self> {
        Ok(Self::new(ReservationQuantity::from_f64(default_per_step)?))
    }

    pub fn default_per_step(&self) -> &ReservationQuantity {
        &self.default_per_step
    }

    pub fn compute(&self, job: &JobDescription) -> DomainResult<ReservationQuantity> {
        compute(job, &self.default_per_step)
    }
}

/// Compute the millicores reserved for `job`.
///
/// Zero steps reserve zero. Fails only on malformed core counts (negative or
/// non-finite).
pub fn compute(
    job: &JobDescription,
    default_per_step: &ReservationQuantity,
) -> DomainResult<ReservationQuantity> {
    let per_core = BigDecimal::from(MILLICORES_PER_CORE);
    let mut reserved = BigDecimal::zero();

    for (index, step) in job.steps.iter().enumerate() {
        let cores = match step.max_cpu_cores() {
            Some(cores) => decimal_from_f64(cores)
                .map_err(|e| DomainError::validation(format!("step {index}: {e}")))?,
            None => BigDecimal::zero(),
        };

        if cores.is_negative() {
            return Err(DomainError::validation(format!(
                "step {index}: max_cpu_cores must be non-negative, got {cores}"
            )));
        }

        let contribution = if cores.is_zero() {
            default_per_step.as_decimal().clone()
        } else {
            with_precision(&cores * &per_core)
        };

        reserved = with_precision(reserved + &contribution);
        trace!(step = index, %contribution, %reserved, "accumulated step reservation");
    }

    Ok(ReservationQuantity(reserved))
}

fn with_precision(value: BigDecimal) -> BigDecimal {
    if value.digits() > DECIMAL_PRECISION {
        value.with_prec(DECIMAL_PRECISION)
    } else {
        value
    }
}

fn decimal_from_f64(value: f64) -> Result<BigDecimal, String> {
    if !value.is_finite() {
        return Err(format!("{value} is not a finite number"));
    }
    // `Display` for f64 yields the shortest text that round-trips, without exponent.
    BigDecimal::from_str(&value.to_string()).map_err(|e| format!("cannot represent {value}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Step;
    use proptest::prelude::*;

    fn quantity(s: &str) -> ReservationQuantity {
        s.parse().unwrap()
    }

    fn job_with(steps: Vec<Step>) -> JobDescription {
        let mut job = JobDescription::new("07b04ce2-7757-4b21-9e15-0b4c2f44be26");
        job.steps = steps;
        job
    }

    #[test]
    fn zero_steps_reserve_zero() {
        let calc = ReservationCalculator::with_default_millicores(4000.0).unwrap();
        let reserved = calc.compute(&job_with(vec![])).unwrap();
        assert!(reserved.is_zero());
    }

    #[test]
    fn declared_cores_ignore_the_default() {
        let calc = ReservationCalculator::with_default_millicores(123.0).unwrap();
        let reserved = calc
            .compute(&job_with(vec![Step::with_max_cpu_cores(64.0)]))
            .unwrap();
        assert_eq!(reserved, quantity("64000"));
    }

    #[test]
    fn mixed_steps_are_additive() {
        let calc = ReservationCalculator::with_default_millicores(4000.0).unwrap();
        let job = job_with(vec![Step::with_max_cpu_cores(2.0), Step::unlimited()]);
        assert_eq!(calc.compute(&job).unwrap(), quantity("6000"));
    }

    #[test]
    fn zero_cores_falls_back_to_default() {
        let calc = ReservationCalculator::with_default_millicores(4000.0).unwrap();
        let job = job_with(vec![Step::with_max_cpu_cores(0.0)]);
        assert_eq!(calc.compute(&job).unwrap(), quantity("4000"));
    }

    #[test]
    fn fractional_cores_are_exact() {
        let calc = ReservationCalculator::with_default_millicores(4000.0).unwrap();
        let job = job_with(vec![
            Step::with_max_cpu_cores(0.1),
            Step::with_max_cpu_cores(0.2),
        ]);
        // 0.1 + 0.2 in binary floating point would not come out as 300.
        assert_eq!(calc.compute(&job).unwrap(), quantity("300"));
    }

    #[test]
    fn negative_cores_are_rejected() {
        let calc = ReservationCalculator::with_default_millicores(4000.0).unwrap();
        let job = job_with(vec![Step::unlimited(), Step::with_max_cpu_cores(-1.0)]);
        let err = calc.compute(&job).unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.starts_with("step 1")));
    }

    #[test]
    fn non_finite_cores_are_rejected() {
        let calc = ReservationCalculator::with_default_millicores(4000.0).unwrap();
        let job = job_with(vec![Step::with_max_cpu_cores(f64::NAN)]);
        assert!(calc.compute(&job).is_err());
    }

    #[test]
    fn negative_default_is_rejected() {
        assert!(ReservationCalculator::with_default_millicores(-5.0).is_err());
    }

    #[test]
    fn quantities_cannot_be_negative() {
        assert!("-1".parse::<ReservationQuantity>().is_err());
        assert!(ReservationQuantity::from_decimal(BigDecimal::from(-250)).is_err());
        assert!("0".parse::<ReservationQuantity>().unwrap().is_zero());
    }

    #[test]
    fn truncation_drops_fraction() {
        assert_eq!(quantity("1234.999").truncated_millicores(), Some(1234));
        assert_eq!(quantity("6000").truncated_millicores(), Some(6000));
        assert_eq!(quantity("0.9").truncated_millicores(), Some(0));
    }

    #[test]
    fn truncation_reports_overflow() {
        assert_eq!(quantity("1e30").truncated_millicores(), None);
    }

    #[test]
    fn precision_is_capped() {
        let calc = ReservationCalculator::with_default_millicores(0.0).unwrap();
        let job = job_with(vec![Step::with_max_cpu_cores(1.23456789012345678)]);
        let reserved = calc.compute(&job).unwrap();
        assert!(reserved.as_decimal().digits() <= DECIMAL_PRECISION);
        assert_eq!(reserved.truncated_millicores(), Some(1234));
    }

    proptest! {
        #[test]
        fn unlimited_steps_reserve_n_times_default(n in 0usize..64, default in 0u32..1_000_000) {
            let calc = ReservationCalculator::with_default_millicores(default as f64).unwrap();
            let job = job_with(vec![Step::unlimited(); n]);
            let expected = BigDecimal::from(n as i64) * BigDecimal::from(default);
            prop_assert_eq!(calc.compute(&job).unwrap().into_decimal(), expected);
        }

        #[test]
        fn whole_cores_reserve_exact_millicores(cores in 1u32..10_000) {
            let calc = ReservationCalculator::with_default_millicores(4000.0).unwrap();
            let job = job_with(vec![Step::with_max_cpu_cores(cores as f64)]);
            let reserved = calc.compute(&job).unwrap();
            prop_assert_eq!(reserved.truncated_millicores(), Some(cores as i64 * MILLICORES_PER_CORE));
        }

        #[test]
        fn concatenated_jobs_sum(a in prop::collection::vec(0u8..16, 0..10), b in prop::collection::vec(0u8..16, 0..10)) {
            let to_steps = |v: &[u8]| -> Vec<Step> {
                v.iter()
                    .map(|&c| if c == 0 { Step::unlimited() } else { Step::with_max_cpu_cores(c as f64 / 4.0) })
                    .collect()
            };
            let calc = ReservationCalculator::with_default_millicores(4000.0).unwrap();

            let left = calc.compute(&job_with(to_steps(&a))).unwrap();
            let right = calc.compute(&job_with(to_steps(&b))).unwrap();
            let mut all = to_steps(&a);
            all.extend(to_steps(&b));
            let whole = calc.compute(&job_with(all)).unwrap();

            prop_assert_eq!(whole.into_decimal(), left.into_decimal() + right.into_decimal());
        }
    }
}
