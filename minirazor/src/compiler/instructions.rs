use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::Encoding;
use crate::generator::ModelType;
use crate::value::Value;

/// Represents an instruction for the VM.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Emits raw source
    EmitRaw(Arc<str>),

    /// Encodes and emits the value on the stack
    Emit,

    /// Loads a constant value.
    LoadConst(Value),

    /// Loads a variable.
    Lookup(Arc<str>),

    /// Looks up an attribute.
    GetAttr(Arc<str>),

    /// Looks up an item.
    GetItem,

    /// Loads a value from the view bag.
    LookupBag(Arc<str>),

    /// Stores the value on the stack in a local variable.
    StoreLocal(Arc<str>),

    /// Stores the value on the stack in the view bag.
    StoreBag(Arc<str>),

    /// Declares the value on the stack as the layout name.
    SetLayout,

    /// Logical negation of the stack top
    Not,

    /// Arithmetic negation of the stack top
    Neg,

    /// Adds the top two values
    Add,

    /// Subtracts the top two values
    Sub,

    /// Multiplies the top two values
    Mul,

    /// Divides the top two values
    Div,

    /// Calculates the remainder of the top two values
    Rem,

    /// Compares the top two values for equality
    Eq,

    /// Compares the top two values for inequality
    Ne,

    /// Checks if the second value is less than the top
    Lt,

    /// Checks if the second value is less than or equal to the top
    Lte,

    /// Checks if the second value is greater than the top
    Gt,

    /// Checks if the second value is greater than or equal to the top
    Gte,

    /// Jumps if the stack top evaluates to false.
    JumpIfFalse(usize),

    /// Jumps if the stack top evaluates to false, pops the value otherwise.
    JumpIfFalseOrPop(usize),

    /// Jumps if the stack top evaluates to true, pops the value otherwise.
    JumpIfTrueOrPop(usize),

    /// Jumps to an instruction.
    Jump(usize),

    /// Starts a loop over the value on the stack.
    PushLoop,

    /// Pushes the next loop item or jumps to the target once exhausted.
    Iterate(usize),

    /// Ends the innermost loop.
    PopLoop,

    /// Runs a section body and captures its output.
    DefineSection(Arc<str>),

    /// Calls a function with the given number of arguments.
    Call(Arc<str>, usize),

    /// Drops the stack top.
    DiscardTop,
}

#[derive(Copy, Clone)]
struct LineInfo {
    first_instruction: u32,
    line: u32,
}

/// Wrapper around instructions to help with location management.
#[derive(Default, Clone)]
pub struct Instructions {
    pub(crate) instructions: Vec<Instruction>,
    line_infos: Vec<LineInfo>,
}

impl Instructions {
    /// Creates an empty instruction list.
    pub fn new() -> Instructions {
        Instructions::default()
    }

    /// Returns an instruction by index
    #[inline(always)]
    pub fn get(&self, idx: usize) -> Option<&Instruction> {
        self.instructions.get(idx)
    }

    /// Adds a new instruction with line number.
    pub fn add_with_line(&mut self, instr: Instruction, line: usize) -> usize {
        let rv = self.instructions.len();
        self.instructions.push(instr);
        let same_loc = self
            .line_infos
            .last()
            .map_or(false, |last_loc| last_loc.line as usize == line);
        if !same_loc {
            self.line_infos.push(LineInfo {
                first_instruction: rv as u32,
                line: line as u32,
            });
        }
        rv
    }

    /// Replaces the jump target of a jump instruction.
    pub fn patch_jump(&mut self, idx: usize, target: usize) {
        if let Some(
            Instruction::Jump(ref mut old)
            | Instruction::JumpIfFalse(ref mut old)
            | Instruction::JumpIfFalseOrPop(ref mut old)
            | Instruction::JumpIfTrueOrPop(ref mut old)
            | Instruction::Iterate(ref mut old),
        ) = self.instructions.get_mut(idx)
        {
            *old = target;
        }
    }

    /// Looks up the line for an instruction
    pub fn get_line(&self, idx: usize) -> Option<usize> {
        let loc = match self
            .line_infos
            .binary_search_by_key(&idx, |x| x.first_instruction as usize)
        {
            Ok(idx) => &self.line_infos[idx],
            Err(0) => return None,
            Err(idx) => &self.line_infos[idx - 1],
        };
        Some(loc.line as usize)
    }

    /// Iterates over instructions with their lines.
    pub fn iter(&self) -> impl Iterator<Item = (&Instruction, usize)> + '_ {
        self.instructions
            .iter()
            .enumerate()
            .map(|(idx, instr)| (instr, self.get_line(idx).unwrap_or(0)))
    }

    /// Returns the number of instructions
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Do we have any instructions?
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

impl fmt::Debug for Instructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct InstructionWrapper<'a>(usize, &'a Instruction, usize);

        impl fmt::Debug for InstructionWrapper<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:>05x} | {:?}  [line {}]", self.0, self.1, self.2)
            }
        }

        let mut list = f.debug_list();
        for (idx, (instr, line)) in self.iter().enumerate() {
            list.entry(&InstructionWrapper(idx, instr, line));
        }
        list.finish()
    }
}

/// A fully assembled template program.
#[derive(Debug, Clone)]
pub struct Program {
    /// The name of the template the program was generated for.
    pub name: Arc<str>,
    /// The model type the program checks models against.
    pub model_type: ModelType,
    /// The encoding emitted values are written with.
    pub encoding: Encoding,
    /// The body of the template.
    pub main: Instructions,
    /// The bodies of the sections the template defines.
    pub sections: BTreeMap<Arc<str>, Instructions>,
}

impl Program {
    /// Creates an empty program.
    pub fn new(name: &str, model_type: ModelType, encoding: Encoding) -> Program {
        Program {
            name: Arc::from(name),
            model_type,
            encoding,
            main: Instructions::new(),
            sections: BTreeMap::new(),
        }
    }
}
