//! Resolution failure chains.

use std::fmt;

use crate::value::{ValueRequirement, ValueSpecification};

/// Why a requirement could not be resolved.
///
/// Failures form a tree assembled bottom-up: a failed input of a candidate
/// function is recorded inside that candidate's [`UnsatisfiedInputs`] record,
/// which in turn is one cause of the parent's [`CouldNotResolve`].
///
/// [`UnsatisfiedInputs`]: ResolutionFailure::UnsatisfiedInputs
/// [`CouldNotResolve`]: ResolutionFailure::CouldNotResolve
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionFailure {
    /// The requirement is already being resolved further up the same chain.
    Recursion {
        /// The re-entered requirement.
        requirement: ValueRequirement,
    },
    /// No function in the registry can produce the requirement.
    NoFunctions {
        /// The requirement.
        requirement: ValueRequirement,
    },
    /// A candidate function's outputs do not satisfy the requirement's constraints.
    ConstraintMismatch {
        /// The requirement.
        requirement: ValueRequirement,
        /// The candidate function.
        function: String,
        /// Outputs the function offered.
        offered: Vec<ValueSpecification>,
    },
    /// A candidate function needed inputs that could not be resolved.
    UnsatisfiedInputs {
        /// The requirement.
        requirement: ValueRequirement,
        /// The candidate function.
        function: String,
        /// Failures of the individual inputs.
        inputs: Vec<ResolutionFailure>,
    },
    /// Every candidate was tried and failed.
    CouldNotResolve {
        /// The requirement.
        requirement: ValueRequirement,
        /// Failures of the individual candidates.
        causes: Vec<ResolutionFailure>,
    },
}

impl ResolutionFailure {
    /// The requirement this record is about.
    pub fn requirement(&self) -> &ValueRequirement {
        match self {
            ResolutionFailure::Recursion { requirement }
            | ResolutionFailure::NoFunctions { requirement }
            | ResolutionFailure::ConstraintMismatch { requirement, .. }
            | ResolutionFailure::UnsatisfiedInputs { requirement, .. }
            | ResolutionFailure::CouldNotResolve { requirement, .. } => requirement,
        }
    }

    /// Returns `true` if a recursion record appears anywhere in the chain.
    pub fn contains_recursion(&self) -> bool {
        match self {
            ResolutionFailure::Recursion { .. } => true,
            ResolutionFailure::NoFunctions { .. } | ResolutionFailure::ConstraintMismatch { .. } => {
                false
            }
            ResolutionFailure::UnsatisfiedInputs { inputs: nested, .. }
            | ResolutionFailure::CouldNotResolve { causes: nested, .. } => {
                nested.iter().any(ResolutionFailure::contains_recursion)
            }
        }
    }

    /// Walk the failure tree with a visitor.
    pub fn accept<V: ResolutionFailureVisitor + ?Sized>(&self, visitor: &mut V) {
        match self {
            ResolutionFailure::Recursion { requirement } => visitor.visit_recursion(requirement),
            ResolutionFailure::NoFunctions { requirement } => {
                visitor.visit_no_functions(requirement)
            }
            ResolutionFailure::ConstraintMismatch {
                requirement,
                function,
                offered,
            } => visitor.visit_constraint_mismatch(requirement, function, offered),
            ResolutionFailure::UnsatisfiedInputs {
                requirement,
                function,
                inputs,
            } => {
                visitor.enter_unsatisfied_inputs(requirement, function);
                for input in inputs {
                    input.accept(visitor);
                }
                visitor.leave();
            }
            ResolutionFailure::CouldNotResolve {
                requirement,
                causes,
            } => {
                visitor.enter_could_not_resolve(requirement);
                for cause in causes {
                    cause.accept(visitor);
                }
                visitor.leave();
            }
        }
    }
}

/// Visitor over a [`ResolutionFailure`] tree.
///
/// All methods default to no-ops.
pub trait ResolutionFailureVisitor {
    /// A recursion record.
    fn visit_recursion(&mut self, _requirement: &ValueRequirement) {}
    /// A missing-function record.
    fn visit_no_functions(&mut self, _requirement: &ValueRequirement) {}
    /// A constraint mismatch record.
    fn visit_constraint_mismatch(
        &mut self,
        _requirement: &ValueRequirement,
        _function: &str,
        _offered: &[ValueSpecification],
    ) {
    }
    /// Start of a candidate whose inputs failed; nested records follow.
    fn enter_unsatisfied_inputs(&mut self, _requirement: &ValueRequirement, _function: &str) {}
    /// Start of an exhausted requirement; nested records follow.
    fn enter_could_not_resolve(&mut self, _requirement: &ValueRequirement) {}
    /// End of the innermost nested block.
    fn leave(&mut self) {}
}

/// Renders a failure tree as indented text.
#[derive(Debug, Default)]
pub struct FailureRenderer {
    out: String,
    depth: usize,
}

impl FailureRenderer {
    /// Create an empty renderer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Render one failure tree.
    pub fn render(failure: &ResolutionFailure) -> String {
        let mut renderer = Self::new();
        failure.accept(&mut renderer);
        renderer.finish()
    }

    /// Take the rendered text.
    pub fn finish(self) -> String {
        self.out
    }

    fn line(&mut self, text: fmt::Arguments<'_>) {
        use fmt::Write;
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
        let _ = self.out.write_fmt(text);
        self.out.push('\n');
    }
}

impl ResolutionFailureVisitor for FailureRenderer {
    fn visit_recursion(&mut self, requirement: &ValueRequirement) {
        self.line(format_args!("{}: recursive requirement", requirement));
    }

    fn visit_no_functions(&mut self, requirement: &ValueRequirement) {
        self.line(format_args!("{}: no functions", requirement));
    }

    fn visit_constraint_mismatch(
        &mut self,
        requirement: &ValueRequirement,
        function: &str,
        offered: &[ValueSpecification],
    ) {
        self.line(format_args!(
            "{}: {} offers {:?} which do not satisfy the constraints",
            requirement, function, offered
        ));
    }

    fn enter_unsatisfied_inputs(&mut self, requirement: &ValueRequirement, function: &str) {
        self.line(format_args!("{}: {} has unsatisfied inputs", requirement, function));
        self.depth += 1;
    }

    fn enter_could_not_resolve(&mut self, requirement: &ValueRequirement) {
        self.line(format_args!("{}: could not resolve", requirement));
        self.depth += 1;
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(FailureRenderer::render(self).trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TargetSpec;

    #[test]
    fn test_renders_nested_chain() {
        let target = TargetSpec::new("SECURITY", "T");
        let failure = ResolutionFailure::CouldNotResolve {
            requirement: ValueRequirement::new("PV", target.clone()),
            causes: vec![ResolutionFailure::UnsatisfiedInputs {
                requirement: ValueRequirement::new("PV", target.clone()),
                function: "F1".into(),
                inputs: vec![ResolutionFailure::NoFunctions {
                    requirement: ValueRequirement::new("MarketRate", target),
                }],
            }],
        };
        let text = failure.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("could not resolve"));
        assert!(lines[1].starts_with("  PV"));
        assert!(lines[2].starts_with("    MarketRate"));
        assert!(!failure.contains_recursion());
    }
}
