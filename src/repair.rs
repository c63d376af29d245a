// SPDX-License-Identifier: MPL-2.0

use std::io::{BufRead, Write};

/// How discovered inconsistencies are handled.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RepairMode {
    /// Ask per error.
    Ask,
    /// Repair everything.
    Yes,
    /// Report only.
    No,
    /// Repair only what is safe to fix unattended.
    Auto,
}

impl RepairMode {
    /// Whether this mode may write to the device at all.
    pub fn can_write(&self) -> bool {
        !matches!(self, RepairMode::No)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProblemCode {
    BsBootRegion,
    DeChecksum,
    FileValidSize,
    FileFirstClus,
    FileSmallerSize,
    FileLargerSize,
    FileDuplicatedClus,
    FileInvalidClus,
    FileZeroNoFat,
}

struct RepairProblem {
    code: ProblemCode,
    /// Accepted unattended in auto mode.
    preen_yes: bool,
    /// Accepting modifies FAT entries or frees clusters, which makes a
    /// reclamation pass necessary.
    touches_fat: bool,
    prompt: &'static str,
}

static PROBLEMS: &[RepairProblem] = &[
    RepairProblem {
        code: ProblemCode::BsBootRegion,
        preen_yes: false,
        touches_fat: false,
        prompt: "Restore",
    },
    RepairProblem {
        code: ProblemCode::DeChecksum,
        preen_yes: true,
        touches_fat: false,
        prompt: "Fix",
    },
    RepairProblem {
        code: ProblemCode::FileValidSize,
        preen_yes: true,
        touches_fat: false,
        prompt: "Fix",
    },
    RepairProblem {
        code: ProblemCode::FileFirstClus,
        preen_yes: false,
        touches_fat: true,
        prompt: "Truncate",
    },
    RepairProblem {
        code: ProblemCode::FileSmallerSize,
        preen_yes: false,
        touches_fat: true,
        prompt: "Truncate",
    },
    RepairProblem {
        code: ProblemCode::FileLargerSize,
        preen_yes: false,
        touches_fat: true,
        prompt: "Truncate",
    },
    RepairProblem {
        code: ProblemCode::FileDuplicatedClus,
        preen_yes: false,
        touches_fat: true,
        prompt: "Truncate",
    },
    RepairProblem {
        code: ProblemCode::FileInvalidClus,
        preen_yes: false,
        touches_fat: true,
        prompt: "Truncate",
    },
    RepairProblem {
        code: ProblemCode::FileZeroNoFat,
        preen_yes: true,
        touches_fat: false,
        prompt: "Fix",
    },
];

fn find_problem(code: ProblemCode) -> &'static RepairProblem {
    PROBLEMS
        .iter()
        .find(|problem| problem.code == code)
        .unwrap_or(&PROBLEMS[0])
}

/// The repair decision state threaded through the whole run.
pub struct Repair {
    pub mode: RepairMode,
    /// Any repair has been accepted.
    pub dirty: bool,
    /// An accepted repair requires the free-cluster reclamation pass.
    pub dirty_fat: bool,
}

impl Repair {
    pub fn new(mode: RepairMode) -> Self {
        Repair {
            mode,
            dirty: false,
            dirty_fat: false,
        }
    }

    /// Decide whether to repair the described problem. Every accepted repair
    /// marks the run dirty.
    pub fn ask(&mut self, code: ProblemCode, description: &str) -> bool {
        let problem = find_problem(code);
        let accept = match self.mode {
            RepairMode::Yes => {
                println!("{}. {}.", description, problem.prompt);
                true
            }
            RepairMode::No => {
                println!("{}. Left uncorrected.", description);
                false
            }
            RepairMode::Auto => {
                if problem.preen_yes {
                    println!("{}. {}.", description, problem.prompt);
                    true
                } else {
                    println!("{}. Left uncorrected.", description);
                    false
                }
            }
            RepairMode::Ask => Self::prompt_user(description, problem.prompt),
        };

        if accept {
            self.dirty = true;
            if problem.touches_fat {
                self.dirty_fat = true;
            }
        }
        accept
    }

    fn prompt_user(description: &str, prompt: &str) -> bool {
        let stdin = std::io::stdin();
        loop {
            print!("{}. {} (y/N)? ", description, prompt);
            let _ = std::io::stdout().flush();

            let mut answer = String::new();
            if stdin.lock().read_line(&mut answer).is_err() {
                return false;
            }
            match answer.trim() {
                "y" | "Y" => return true,
                "" | "n" | "N" => return false,
                _ => continue,
            }
        }
    }
}
