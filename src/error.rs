// (C) 2020 Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

// Error taxonomy surfaced to the host, see the `error` callback and
// `VM::exec_in_module`. Mirrors the wire-visible kinds rather than a
// generic `std::error::Error` tree, since the host API is a flat C-style
// enum, not a trait object.

use crate::value::TypeTag;
use enumflags2::BitFlags;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    None,
    Lexer,
    Compile,
    Runtime,
    FunctionArityMismatch,
    InvalidOpOnType,
    InvalidArgument,
    ModuleAlreadyDefined,
    ModuleNotFound,
    OutOfMemory,
    StackTraceBegin,
    StackTraceEnd,
}

pub type TypeSet = BitFlags<TypeTag>;

// Internal runtime error, carrying enough to format `vm.last_error` and
// feed the error callback. Converted to a bare `ErrorKind` at the host
// boundary (see api.rs).
#[derive(Clone, Debug, PartialEq)]
pub enum RuntimeError {
    Underflow,
    Overflow,
    TypeError { expect: TypeSet, got: TypeTag },
    TypeMismatch(TypeTag, TypeTag),
    UnknownSymbol(String),
    IllegalOpcode,
    IllegalAddr(usize),
    Arity { expected: i32, got: usize },
    DivideByZero,
    NotCallable,
    Custom(String),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Arity { .. } => ErrorKind::FunctionArityMismatch,
            RuntimeError::TypeError { .. } | RuntimeError::TypeMismatch(_, _) => {
                ErrorKind::InvalidOpOnType
            }
            _ => ErrorKind::Runtime,
        }
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::Underflow => write!(f, "stack underflow"),
            RuntimeError::Overflow => write!(f, "stack overflow"),
            RuntimeError::TypeError { got, .. } => write!(f, "unexpected type {:?}", got),
            RuntimeError::TypeMismatch(a, b) => write!(f, "type mismatch: {:?} vs {:?}", a, b),
            RuntimeError::UnknownSymbol(s) => write!(f, "unknown symbol '{}'", s),
            RuntimeError::IllegalOpcode => write!(f, "illegal opcode"),
            RuntimeError::IllegalAddr(a) => write!(f, "illegal address {}", a),
            RuntimeError::Arity { expected, got } => {
                write!(f, "expected {} argument(s), got {}", expected, got)
            }
            RuntimeError::DivideByZero => write!(f, "division by zero"),
            RuntimeError::NotCallable => write!(f, "value is not callable"),
            RuntimeError::Custom(s) => write!(f, "{}", s),
        }
    }
}

// A single compile-time diagnostic, carrying the line number and the
// source-line slice so the host error callback can render context.
#[derive(Clone, Debug, PartialEq)]
pub struct CompileError {
    pub line: i32,
    pub message: String,
}

impl CompileError {
    pub fn new(line: i32, message: impl Into<String>) -> Self {
        CompileError {
            line,
            message: message.into(),
        }
    }
}
