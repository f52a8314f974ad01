//! Entry points provided by the runtime and called from generated code.

use ember_il::object_model::{ClassId, FunctionId};
use std::fmt::{self, Display, Formatter};

use crate::isa::Register;

/// A shared code stub. Stubs follow a register-based convention and
/// preserve every register except the ones carrying their results.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StubId {
    /// Rebuilds unoptimized frames from the deopt info selected by the
    /// return address of the call.
    Deoptimize,
    /// Requests optimization of the function in the IC data register.
    OptimizeFunction,
    StackOverflow,
    /// Returns a new instance, fields initialized to null, in the result
    /// register.
    AllocateObject(ClassId),
    AllocateDouble,
    AllocateMint,
    /// Object in the result register.
    WriteBarrier,
    /// Looks up the instance in the type-test instance register in the
    /// cache in the subtype-test-cache register. Leaves true, false or
    /// null (miss) in the subtype-test-cache result register.
    SubtypeTestCache,
    /// Dispatches on the receiver and the IC data in the IC data
    /// register, updating the cache.
    InlineCache { num_args_tested: u8 },
    /// Dispatches through the megamorphic cache in the IC data register.
    MegamorphicCall,
    /// Precompiled-mode call site whose behavior is given by the object
    /// in the IC data register.
    SwitchableCall,
    /// Compares the two values on top of the stack for identity, treating
    /// boxed numbers with equal payloads as identical. Leaves true or
    /// false in the result register.
    IdenticalWithNumberCheck,
    /// Invoked with the frame of the failed callee already torn down and
    /// the arguments descriptor still in its register.
    NoSuchMethodDispatcher,
}

impl StubId {
    pub fn name(self) -> &'static str {
        match self {
            StubId::Deoptimize => "Deoptimize",
            StubId::OptimizeFunction => "OptimizeFunction",
            StubId::StackOverflow => "StackOverflow",
            StubId::AllocateObject(_) => "AllocateObject",
            StubId::AllocateDouble => "AllocateDouble",
            StubId::AllocateMint => "AllocateMint",
            StubId::WriteBarrier => "WriteBarrier",
            StubId::SubtypeTestCache => "SubtypeTestCache",
            StubId::InlineCache { .. } => "InlineCache",
            StubId::MegamorphicCall => "MegamorphicCall",
            StubId::SwitchableCall => "SwitchableCall",
            StubId::IdenticalWithNumberCheck => "IdenticalWithNumberCheck",
            StubId::NoSuchMethodDispatcher => "NoSuchMethodDispatcher",
        }
    }

    /// Whether a call to the stub can trigger a garbage collection and
    /// therefore needs a stack map.
    pub fn can_allocate(self) -> bool {
        !matches!(
            self,
            StubId::Deoptimize
                | StubId::WriteBarrier
                | StubId::SubtypeTestCache
                | StubId::IdenticalWithNumberCheck
        )
    }
}

impl Display for StubId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StubId::AllocateObject(cid) => write!(f, "AllocateObject<{cid}>"),
            StubId::InlineCache { num_args_tested } => write!(f, "InlineCache<{num_args_tested}>"),
            other => f.write_str(other.name()),
        }
    }
}

/// A runtime function called with its arguments on the stack. The result,
/// if any, is returned in the result register and the caller drops the
/// arguments.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeEntry {
    /// (exception)
    Throw,
    /// (exception, stack trace)
    ReThrow,
    /// (instance, type, instantiator type arguments, function type
    /// arguments, subtype test cache) -> bool
    Instanceof,
    /// (instance, type, instantiator type arguments, function type
    /// arguments, destination name, subtype test cache). Throws on failure.
    TypeCheck,
    /// (value)
    NonBoolTypeError,
    NullError,
}

impl RuntimeEntry {
    pub fn name(self) -> &'static str {
        match self {
            RuntimeEntry::Throw => "Throw",
            RuntimeEntry::ReThrow => "ReThrow",
            RuntimeEntry::Instanceof => "Instanceof",
            RuntimeEntry::TypeCheck => "TypeCheck",
            RuntimeEntry::NonBoolTypeError => "NonBoolTypeError",
            RuntimeEntry::NullError => "NullError",
        }
    }

    pub fn argument_count(self) -> u32 {
        match self {
            RuntimeEntry::Throw | RuntimeEntry::NonBoolTypeError => 1,
            RuntimeEntry::ReThrow => 2,
            RuntimeEntry::Instanceof => 5,
            RuntimeEntry::TypeCheck => 6,
            RuntimeEntry::NullError => 0,
        }
    }

    /// Entries that never return to the caller.
    pub fn is_throwing(self) -> bool {
        matches!(
            self,
            RuntimeEntry::Throw
                | RuntimeEntry::ReThrow
                | RuntimeEntry::NonBoolTypeError
                | RuntimeEntry::NullError
        )
    }
}

/// Destination of a call or tail call instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CallTarget {
    Stub(StubId),
    Runtime(RuntimeEntry),
    /// Direct call to the entry of a function's current code.
    Function(FunctionId),
    /// Indirect call through a function object held in a register.
    Register(Register),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throwing_entries_take_their_arguments_from_the_stack() {
        assert!(RuntimeEntry::Throw.is_throwing());
        assert!(!RuntimeEntry::Instanceof.is_throwing());
        assert_eq!(RuntimeEntry::TypeCheck.argument_count(), 6);
        assert_eq!(StubId::InlineCache { num_args_tested: 2 }.to_string(), "InlineCache<2>");
    }
}
