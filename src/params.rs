//! The tunable controller coefficients we push to the robot, and the table
//! that maps each of them onto its wire command.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Absolute tolerance used when comparing a set against the robot's echo.
/// The firmware prints its floats with limited precision, so exact
/// equality is never what we want.
pub const DEFAULT_TOLERANCE: f64 = 0.01;

/// One named field of a [`ParameterSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamField {
    /// Proportional gain
    Kp,
    /// Integral gain
    Ki,
    /// Derivative gain
    Kd,
    /// Initial balance trim, in degrees
    InitBalance,
    /// Power gain multiplier
    PowerGain,
}

/// Every field in the order it is written to the robot. Both the first send
/// and every retry walk this table, so adding a field here is all it takes
/// to have it sent and verified.
pub const PARAM_FIELDS: [ParamField; 5] = [
    ParamField::Kp,
    ParamField::Ki,
    ParamField::Kd,
    ParamField::InitBalance,
    ParamField::PowerGain,
];

impl ParamField {
    /// The key used in the outbound `<key>=<value>` command.
    pub fn wire_key(self) -> &'static str {
        match self {
            ParamField::Kp => "kp",
            ParamField::Ki => "ki",
            ParamField::Kd => "kd",
            ParamField::InitBalance => "init_balance",
            ParamField::PowerGain => "power_gain",
        }
    }

    /// Labels the robot may use for this field when it echoes its active
    /// parameters. Matched case-insensitively.
    pub fn echo_labels(self) -> &'static [&'static str] {
        match self {
            ParamField::Kp => &["KP"],
            ParamField::Ki => &["KI"],
            ParamField::Kd => &["KD"],
            ParamField::InitBalance => &["INIT_BALANCE", "INIT", "OFFSET"],
            ParamField::PowerGain => &["POWER_GAIN", "POWER", "GAIN"],
        }
    }

    /// The gain fields must always be present in an echo; the rest are
    /// picked up when the firmware happens to print them.
    pub fn is_mandatory(self) -> bool {
        matches!(self, ParamField::Kp | ParamField::Ki | ParamField::Kd)
    }
}

impl fmt::Display for ParamField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_key())
    }
}

/// A full set of controller parameters. Immutable once built; the scheduler
/// or the operator makes a new one for every change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterSet {
    /// Proportional gain
    pub kp: f64,
    /// Integral gain
    pub ki: f64,
    /// Derivative gain
    pub kd: f64,
    /// Initial balance trim, in degrees
    pub init_balance: f64,
    /// Power gain multiplier
    pub power_gain: f64,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            kp: 3.3,
            ki: 0.0,
            kd: 0.2,
            init_balance: 0.0,
            power_gain: 0.0,
        }
    }
}

impl ParameterSet {
    /// A set with only the gains given and the auxiliary fields zeroed.
    pub fn gains(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            init_balance: 0.0,
            power_gain: 0.0,
        }
    }

    /// Returns a copy with the auxiliary fields taken from `other`.
    pub fn with_aux_from(self, other: &ParameterSet) -> Self {
        Self {
            init_balance: other.init_balance,
            power_gain: other.power_gain,
            ..self
        }
    }

    /// Reads one field.
    pub fn get(&self, field: ParamField) -> f64 {
        match field {
            ParamField::Kp => self.kp,
            ParamField::Ki => self.ki,
            ParamField::Kd => self.kd,
            ParamField::InitBalance => self.init_balance,
            ParamField::PowerGain => self.power_gain,
        }
    }

    /// Field-by-field comparison with an absolute tolerance.
    pub fn matches(&self, other: &ParameterSet, tolerance: f64) -> bool {
        PARAM_FIELDS
            .iter()
            .all(|&field| within(self.get(field), other.get(field), tolerance))
    }

    /// The `<key>=<value>` lines that put this set on the robot, in table
    /// order.
    pub fn wire_lines(&self) -> Vec<String> {
        PARAM_FIELDS
            .iter()
            .map(|&field| format!("{}={:.4}", field.wire_key(), self.get(field)))
            .collect()
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KP={:.3} KI={:.3} KD={:.3} init={:.2} power={:.2}",
            self.kp, self.ki, self.kd, self.init_balance, self.power_gain
        )
    }
}

/// The parameters as the robot reported them. The gains are always there;
/// auxiliary fields only if the firmware printed them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EchoedParams {
    /// Echoed proportional gain
    pub kp: f64,
    /// Echoed integral gain
    pub ki: f64,
    /// Echoed derivative gain
    pub kd: f64,
    /// Echoed initial balance trim, if present
    pub init_balance: Option<f64>,
    /// Echoed power gain, if present
    pub power_gain: Option<f64>,
}

impl EchoedParams {
    /// Reads one field, `None` if the echo did not carry it.
    pub fn get(&self, field: ParamField) -> Option<f64> {
        match field {
            ParamField::Kp => Some(self.kp),
            ParamField::Ki => Some(self.ki),
            ParamField::Kd => Some(self.kd),
            ParamField::InitBalance => self.init_balance,
            ParamField::PowerGain => self.power_gain,
        }
    }

    /// Lists every field that disagrees with `expected`. A mandatory field
    /// the echo lacks counts as a disagreement; an optional one is skipped.
    pub fn discrepancies(&self, expected: &ParameterSet, tolerance: f64) -> Vec<Discrepancy> {
        PARAM_FIELDS
            .iter()
            .filter_map(|&field| {
                let want = expected.get(field);
                match self.get(field) {
                    Some(got) if within(want, got, tolerance) => None,
                    Some(got) => Some(Discrepancy {
                        field,
                        expected: want,
                        echoed: Some(got),
                    }),
                    None if field.is_mandatory() => Some(Discrepancy {
                        field,
                        expected: want,
                        echoed: None,
                    }),
                    None => None,
                }
            })
            .collect()
    }

    /// True if the echo confirms `expected` within `tolerance`.
    pub fn confirms(&self, expected: &ParameterSet, tolerance: f64) -> bool {
        self.discrepancies(expected, tolerance).is_empty()
    }

    /// The echo as a full set, with missing auxiliary fields filled from
    /// `fallback`.
    pub fn to_set(&self, fallback: &ParameterSet) -> ParameterSet {
        ParameterSet {
            kp: self.kp,
            ki: self.ki,
            kd: self.kd,
            init_balance: self.init_balance.unwrap_or(fallback.init_balance),
            power_gain: self.power_gain.unwrap_or(fallback.power_gain),
        }
    }
}

/// One field where the robot's echo and what we sent disagree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Discrepancy {
    /// The field in question
    pub field: ParamField,
    /// What we sent
    pub expected: f64,
    /// What came back, `None` if it was missing
    pub echoed: Option<f64>,
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.echoed {
            Some(got) => write!(f, "{} sent {:.4} got {:.4}", self.field, self.expected, got),
            None => write!(f, "{} sent {:.4} got nothing", self.field, self.expected),
        }
    }
}

fn within(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_within_tolerance() {
        let a = ParameterSet {
            kp: 2.0,
            ki: 0.5,
            kd: 0.25,
            init_balance: -1.0,
            power_gain: 1.2,
        };
        let b = ParameterSet {
            kp: 2.004,
            ki: 0.495,
            kd: 0.259,
            init_balance: -1.009,
            power_gain: 1.201,
        };
        assert!(a.matches(&b, DEFAULT_TOLERANCE));
        assert!(b.matches(&a, DEFAULT_TOLERANCE));
    }

    #[test]
    fn test_any_field_out_of_tolerance_fails() {
        let base = ParameterSet::gains(2.0, 0.5, 0.25);
        for field in PARAM_FIELDS {
            let mut other = base;
            match field {
                ParamField::Kp => other.kp += 0.02,
                ParamField::Ki => other.ki -= 0.02,
                ParamField::Kd => other.kd += 0.5,
                ParamField::InitBalance => other.init_balance = 0.1,
                ParamField::PowerGain => other.power_gain = -0.03,
            }
            assert!(!base.matches(&other, DEFAULT_TOLERANCE), "{field} slipped through");
        }
    }

    #[test]
    fn test_wire_lines_follow_table_order() {
        let set = ParameterSet {
            kp: 1.5,
            ki: 0.0,
            kd: 0.2,
            init_balance: -0.75,
            power_gain: 1.0,
        };
        assert_eq!(
            set.wire_lines(),
            vec![
                "kp=1.5000",
                "ki=0.0000",
                "kd=0.2000",
                "init_balance=-0.7500",
                "power_gain=1.0000",
            ]
        );
    }

    #[test]
    fn test_echo_ignores_missing_optional_fields() {
        let sent = ParameterSet {
            kp: 3.3,
            ki: 0.1,
            kd: 0.2,
            init_balance: 2.0,
            power_gain: 0.5,
        };
        let echo = EchoedParams {
            kp: 3.3,
            ki: 0.1,
            kd: 0.2,
            init_balance: None,
            power_gain: Some(0.5),
        };
        assert!(echo.confirms(&sent, DEFAULT_TOLERANCE));

        let wrong = EchoedParams {
            power_gain: Some(0.7),
            ..echo
        };
        let found = wrong.discrepancies(&sent, DEFAULT_TOLERANCE);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field, ParamField::PowerGain);
    }
}
