//! Tagged-pointer builtins for the bytecode layer.
//!
//! Each primitive in [`crate::tag`] is exposed as a procedure working on a
//! value stack, and [`install_tag_builtins`] allocates a code object and a
//! closure per procedure and registers the closure under its symbol name.
//!
//! Stack effects, with the top of the stack rightmost:
//!
//! | builtin            | effect                   |
//! |--------------------|--------------------------|
//! | `make_tag`         | `ptr tag -- tagged`      |
//! | `shift_make_tag`   | `word tag -- tagged`     |
//! | `break_tag`        | `tagged -- ptr tag`      |
//! | `break_shift_tag`  | `tagged -- word tag`     |
//! | `unshift_value`    | `word -- word`           |

use std::ptr::NonNull;

use crate::error::StackUnderflow;
use crate::heap::{AllocOpts, Heap};
use crate::scope::NoGcScope;
use crate::tag::{break_shift_tag, break_tag, make_tag, shift_make_tag, unshift_value};
use crate::trace::Tracer;

/// Words in a builtin code object: the builtin id and its input count.
pub const CODE_WORDS: usize = 2;

/// Words in a closure: the code pointer and the environment (null for
/// builtins).
pub const CLOSURE_WORDS: usize = 2;

/// One tagged-pointer procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum TagBuiltin {
    /// `ptr tag -- tagged`
    MakeTag = 0,
    /// `word tag -- tagged`
    ShiftMakeTag = 1,
    /// `tagged -- ptr tag`
    BreakTag = 2,
    /// `tagged -- word tag`
    BreakShiftTag = 3,
    /// `word -- word`
    UnshiftValue = 4,
}

impl TagBuiltin {
    /// Every builtin, in id order.
    pub const ALL: [Self; 5] = [
        Self::MakeTag,
        Self::ShiftMakeTag,
        Self::BreakTag,
        Self::BreakShiftTag,
        Self::UnshiftValue,
    ];

    /// Symbol name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MakeTag => "make_tag",
            Self::ShiftMakeTag => "shift_make_tag",
            Self::BreakTag => "break_tag",
            Self::BreakShiftTag => "break_shift_tag",
            Self::UnshiftValue => "unshift_value",
        }
    }

    /// `(inputs, outputs)`.
    #[must_use]
    pub const fn stack_effect(self) -> (usize, usize) {
        match self {
            Self::MakeTag | Self::ShiftMakeTag => (2, 1),
            Self::BreakTag | Self::BreakShiftTag => (1, 2),
            Self::UnshiftValue => (1, 1),
        }
    }

    /// The builtin with this id.
    #[must_use]
    pub const fn from_id(id: usize) -> Option<Self> {
        if id < Self::ALL.len() {
            Some(Self::ALL[id])
        } else {
            None
        }
    }

    /// Look a builtin up by symbol name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }

    /// Run the builtin on `stack`.
    ///
    /// # Errors
    ///
    /// Returns [`StackUnderflow`] and leaves the stack untouched if it holds
    /// fewer values than the builtin consumes.
    pub fn call(self, stack: &mut Vec<usize>) -> Result<(), StackUnderflow> {
        let (needed, _) = self.stack_effect();
        if stack.len() < needed {
            return Err(StackUnderflow {
                builtin: self.name(),
                needed,
                found: stack.len(),
            });
        }
        let base = stack.len() - needed;
        let args: Vec<usize> = stack.drain(base..).collect();

        match self {
            Self::MakeTag => stack.push(make_tag(args[0], args[1])),
            Self::ShiftMakeTag => stack.push(shift_make_tag(args[0], args[1])),
            Self::BreakTag => {
                let (ptr, tag) = break_tag(args[0]);
                stack.extend([ptr, tag]);
            }
            Self::BreakShiftTag => {
                let (word, tag) = break_shift_tag(args[0]);
                stack.extend([word, tag]);
            }
            Self::UnshiftValue => stack.push(unshift_value(args[0])),
        }
        Ok(())
    }
}

/// Where installed closures are registered.
///
/// The table must trace the closures it holds: once installation returns,
/// they are reachable through it alone.
pub trait SymbolTable: Tracer {
    /// Bind `name` to `closure`.
    fn add_symbol(&mut self, name: &str, closure: NonNull<u8>);
}

/// Allocate and register a closure for every [`TagBuiltin`].
///
/// Each code object and closure pair is built inside its own
/// [`NoGcScope`], so neither can be collected before the closure is in the
/// symbol table.
pub fn install_tag_builtins<S: SymbolTable + ?Sized>(heap: &mut Heap, symbols: &mut S) {
    for builtin in TagBuiltin::ALL {
        let mut scope = NoGcScope::new(heap, "installing tagged-pointer builtins");
        let code = scope.alloc(CODE_WORDS, AllocOpts::Normal);
        let closure = scope.alloc(CLOSURE_WORDS, AllocOpts::Normal);

        let code_words = code.cast::<usize>().as_ptr();
        let closure_words = closure.cast::<usize>().as_ptr();
        // SAFETY: both cells were just allocated with room for two words.
        unsafe {
            code_words.write(builtin as usize);
            code_words.add(1).write(builtin.stack_effect().0);
            closure_words.write(code.as_ptr() as usize);
            closure_words.add(1).write(0);
        }

        symbols.add_symbol(builtin.name(), closure);
    }
}

/// The builtin a closure made by [`install_tag_builtins`] runs.
///
/// # Safety
///
/// `closure` must be a live closure cell whose code pointer is null or a
/// live code cell.
#[must_use]
pub unsafe fn closure_builtin(closure: NonNull<u8>) -> Option<TagBuiltin> {
    // SAFETY: the caller guarantees `closure` is live.
    let code = unsafe { closure.cast::<usize>().as_ptr().read() } as *const usize;
    if code.is_null() {
        return None;
    }
    // SAFETY: the caller guarantees the code cell is live.
    TagBuiltin::from_id(unsafe { code.read() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{NUM_TAG_BITS, WORD_SIZE};

    #[test]
    fn test_ids_and_names_round_trip() {
        for (id, builtin) in TagBuiltin::ALL.into_iter().enumerate() {
            assert_eq!(builtin as usize, id);
            assert_eq!(TagBuiltin::from_id(id), Some(builtin));
            assert_eq!(TagBuiltin::from_name(builtin.name()), Some(builtin));
        }
        assert_eq!(TagBuiltin::from_id(TagBuiltin::ALL.len()), None);
        assert_eq!(TagBuiltin::from_name("make_tagged"), None);
    }

    #[test]
    fn test_make_and_break_tag() {
        let ptr = 64 * WORD_SIZE;
        let mut stack = vec![7, ptr, 2];
        TagBuiltin::MakeTag.call(&mut stack).unwrap();
        assert_eq!(stack, vec![7, ptr | 2]);
        TagBuiltin::BreakTag.call(&mut stack).unwrap();
        assert_eq!(stack, vec![7, ptr, 2]);
    }

    #[test]
    fn test_shift_builtins() {
        let mut stack = vec![1000, 1];
        TagBuiltin::ShiftMakeTag.call(&mut stack).unwrap();
        assert_eq!(stack, vec![(1000 << NUM_TAG_BITS) | 1]);

        let mut copy = stack.clone();
        TagBuiltin::BreakShiftTag.call(&mut stack).unwrap();
        assert_eq!(stack, vec![1000, 1]);

        TagBuiltin::UnshiftValue.call(&mut copy).unwrap();
        assert_eq!(copy, vec![1000]);
    }

    #[test]
    fn test_underflow_leaves_stack_alone() {
        let mut stack = vec![5];
        let err = TagBuiltin::MakeTag.call(&mut stack).unwrap_err();
        assert_eq!(
            err,
            StackUnderflow {
                builtin: "make_tag",
                needed: 2,
                found: 1
            }
        );
        assert_eq!(stack, vec![5]);

        let mut empty = Vec::new();
        assert!(TagBuiltin::UnshiftValue.call(&mut empty).is_err());
    }
}
