//! Deep-copy correctness oracle.
//!
//! The check runs inside the interpreter under test, so it exercises that build's `copy`
//! module and not the host's. It builds a self-referential composite structure, copies it
//! once, and checks four properties in order:
//!
//! 1. identity: the copy is a new object,
//! 2. equality: the copy equals the original once the self key is excluded,
//! 3. mutation independence: writes through the copy never reach the original, at every
//!    nesting level in the structure,
//! 4. cycle rewiring: the copy's self slot points at the copy, the original's at the original.
//!
//! A failing check prints `ORACLE-FAIL <check>: <detail>` on stderr and exits 1.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::harness::Invocation;

/// Copier exercised in production.
pub const DEEPCOPY: &str = "copy.deepcopy";

const FAIL_MARKER: &str = "ORACLE-FAIL ";

const PROGRAM_TEMPLATE: &str = r#"
import copy
import sys

copier = __COPIER__


def fail(check, detail):
    sys.stderr.write("ORACLE-FAIL %s: %s\n" % (check, detail))
    sys.exit(1)


data = {
    "simple_list": [1, 2, [3, 4]],
    "nested_dict": {"a": 10, "b": {"c": 20, "d": [1, 2, 3]}},
    "tuple_mix": (1, [2, 3, {"y": 6}], {"x": 5}),
    "composite": [
        {"nums": [1, 2, 3], "inner": {"k": (1, 2)}},
        [{"nested": [{"v": 9}]}],
        ({"deep": {"copy": [42]}},),
    ],
    "empty_structs": {"list": [], "tuple": (), "dict": {}},
}
data["self"] = data

clone = copier(data)

if clone is data:
    fail("identity", "copy is the original object")


def without_self(d):
    return {k: v for k, v in d.items() if k != "self"}


if not isinstance(clone, dict) or without_self(clone) != without_self(data):
    fail("equality", "copy differs from original outside the self key")

clone["simple_list"][2][0] = 999
clone["nested_dict"]["b"]["c"] = -20
clone["nested_dict"]["b"]["d"][1] = 777
clone["tuple_mix"][1][0] = 555
clone["tuple_mix"][2]["x"] = -5
clone["tuple_mix"][1][2]["y"] = 666
clone["composite"][0]["inner"]["k"] = (8, 8)
clone["composite"][1][0]["nested"][0]["v"] = -9
clone["composite"][2][0]["deep"]["copy"].append(43)
clone["empty_structs"]["list"].append("x")
clone["empty_structs"]["dict"]["k"] = "v"

levels = [
    ("sequence-in-sequence", data["simple_list"][2][0] == 3),
    ("mapping-in-mapping", data["nested_dict"]["b"]["c"] == 20),
    ("sequence-in-mapping-in-mapping", data["nested_dict"]["b"]["d"][1] == 2),
    ("sequence-in-tuple", data["tuple_mix"][1][0] == 2),
    ("mapping-in-tuple", data["tuple_mix"][2]["x"] == 5),
    ("mapping-in-sequence-in-tuple", data["tuple_mix"][1][2]["y"] == 6),
    ("tuple-in-mapping-in-sequence", data["composite"][0]["inner"]["k"] == (1, 2)),
    ("mapping-in-sequence-in-sequence", data["composite"][1][0]["nested"][0]["v"] == 9),
    ("sequence-in-mapping-in-tuple", data["composite"][2][0]["deep"]["copy"] == [42]),
    ("empty-sequence", data["empty_structs"]["list"] == []),
    ("empty-mapping", data["empty_structs"]["dict"] == {}),
]
for level, intact in levels:
    if not intact:
        fail("mutation-independence", "write through copy reached original at " + level)

if clone["self"] is not clone:
    fail("cycle-rewiring", "copy's self slot does not point at the copy")
if data["self"] is not data:
    fail("cycle-rewiring", "original's self slot no longer points at the original")

print("deepcopy correctness verified")
"#;

/// One of the four properties the oracle checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OracleCheck {
    Identity,
    Equality,
    MutationIndependence,
    CycleRewiring,
}

impl OracleCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleCheck::Identity => "identity",
            OracleCheck::Equality => "equality",
            OracleCheck::MutationIndependence => "mutation-independence",
            OracleCheck::CycleRewiring => "cycle-rewiring",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        [
            OracleCheck::Identity,
            OracleCheck::Equality,
            OracleCheck::MutationIndependence,
            OracleCheck::CycleRewiring,
        ]
        .into_iter()
        .find(|c| c.as_str() == label)
    }
}

impl fmt::Display for OracleCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum CorrectnessVerdict {
    Pass {
        output: String,
    },
    Fail {
        code: i32,
        /// `None` when the program died before reaching a check (e.g. an import error).
        check: Option<OracleCheck>,
        stderr: String,
    },
}

impl CorrectnessVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, CorrectnessVerdict::Pass { .. })
    }
}

/// The verification program with `copier` substituted as the copy function under test.
pub(crate) fn program(copier: &str) -> String {
    PROGRAM_TEMPLATE.replace("__COPIER__", copier)
}

/// Run the oracle against `python` using the stock `copy.deepcopy`.
pub fn verify(python: &Path) -> Result<CorrectnessVerdict> {
    verify_with(python, DEEPCOPY)
}

pub(crate) fn verify_with(python: &Path, copier: &str) -> Result<CorrectnessVerdict> {
    info!(python = %python.display(), "running deepcopy correctness checks");
    let done = Invocation::new(python)
        .arg("-c")
        .arg(program(copier))
        .run()?;

    if done.success() {
        return Ok(CorrectnessVerdict::Pass {
            output: done.stdout.trim().to_string(),
        });
    }

    let check = failed_check(&done.stderr);
    warn!(code = done.exit_code(), check = ?check, "deepcopy correctness check failed");
    Ok(CorrectnessVerdict::Fail {
        code: done.exit_code(),
        check,
        stderr: done.stderr,
    })
}

fn failed_check(stderr: &str) -> Option<OracleCheck> {
    stderr.lines().find_map(|line| {
        let rest = line.strip_prefix(FAIL_MARKER)?;
        let (label, _) = rest.split_once(':')?;
        OracleCheck::from_label(label.trim())
    })
}
