// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used across all compiler phases.
// Diagnostics name graph entities (nodes, terminals, variables), never a
// stage: the editor front end maps entity ids back to screen positions.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::id::{DiagramId, NodeId, TermId, VarId, WireId};

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0201`, `W0601`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different semantic
/// meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// Type mismatch: two wired terminals resolved to incompatible types.
    pub const E0201: DiagCode = DiagCode("E0201");
    /// No primitive signature candidate matched the connected types.
    pub const E0202: DiagCode = DiagCode("E0202");
    /// Required input terminal has no wire.
    pub const E0203: DiagCode = DiagCode("E0203");
    /// Lifetime variable could not be resolved to an enclosing scope.
    pub const E0301: DiagCode = DiagCode("E0301");
    /// A borrowed reference escapes the scope that created it.
    pub const E0302: DiagCode = DiagCode("E0302");
    /// Conflicting borrow: a mutable borrow overlaps another use.
    pub const E0303: DiagCode = DiagCode("E0303");
    /// A variable is consumed (moved) more than once on one execution path.
    pub const E0304: DiagCode = DiagCode("E0304");
    /// Cyclic data dependency through plain wires.
    pub const E0401: DiagCode = DiagCode("E0401");
    /// Diagram cannot be partitioned into state groups.
    pub const E0501: DiagCode = DiagCode("E0501");
    /// Allocator invariant violation (internal defect, fatal).
    pub const E0901: DiagCode = DiagCode("E0901");
    /// A structure output is not fed by every branch.
    pub const W0601: DiagCode = DiagCode("W0601");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Subject ──────────────────────────────────────────────────────────────

/// The graph entity a diagnostic is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Diagram(DiagramId),
    Node(NodeId),
    Terminal(TermId),
    Wire(WireId),
    Variable(VarId),
    /// Whole-function diagnostics with no single anchor.
    Function,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Diagram(d) => write!(f, "diagram {}", d.0),
            Subject::Node(n) => write!(f, "node {}", n.0),
            Subject::Terminal(t) => write!(f, "terminal {}", t.0),
            Subject::Wire(w) => write!(f, "wire {}", w.0),
            Subject::Variable(v) => write!(f, "variable {}", v.0),
            Subject::Function => write!(f, "function"),
        }
    }
}

/// A secondary entity providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct Related {
    pub subject: Subject,
    pub label: String,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by any phase.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub subject: Subject,
    pub message: String,
    pub hint: Option<String>,
    pub related: Vec<Related>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, or related entities.
    pub fn new(level: DiagLevel, subject: Subject, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            subject,
            message: message.into(),
            hint: None,
            related: Vec::new(),
        }
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related entity.
    pub fn with_related(mut self, subject: Subject, label: impl Into<String>) -> Self {
        self.related.push(Related {
            subject,
            label: label.into(),
        });
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {} ({})", level, code, self.message, self.subject)?;
        } else {
            write!(f, "{}: {} ({})", level, self.message, self.subject)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        for rel in &self.related {
            write!(f, "\n  note: {} ({})", rel.label, rel.subject)?;
        }
        Ok(())
    }
}

/// True if any diagnostic in the slice is error-level.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}
