use super::{
    family_lookup, pack_origin, AsmClassifier, DataOrigin, InstructionFamily, InstructionPair,
    InstructionType, ORIGIN_INPUT_SHIFT,
};

const ARITH_OP: &[&str] = &[
    "add", "sub", "div", "mul", "dp", "abs", "sign", "avg", "dec", "inc", "neg",
];
const BIT_MAN_OP: &[&str] = &[
    "shuf", "lzcn", "cvt", "blend", "perm", "extract", "compress", "insert", "unpck",
];
const LOGIC_OP: &[&str] = &[
    "and", "or", "shl", "shr", "sll", "sra", "srl", "tern", "test", "xor", "cmp", "not",
];
const MEM_OP: &[&str] = &[
    "expand", "gather", "scatter", "mov", "sto", "lah", "lds", "lea", "les", "lod",
];
const JUMP_OP: &[&str] = &["jmp"];
const BRANCH_OP: &[&str] = &[
    "ja", "jb", "jc", "je", "jg", "jl", "jle", "jn", "jo", "jp", "js", "jz",
];

/// Classifier for x86 instructions as disassembled by perf/objdump
/// (AT&T syntax: source operands first, destination last).
pub struct X86Classifier;

fn operand_class(token: &str) -> DataOrigin {
    let token = token.trim();
    if token.is_empty() {
        return DataOrigin::Unknown;
    }
    if token.contains('(') || token.contains(')') {
        return DataOrigin::Memory;
    }
    match token.as_bytes()[0] {
        b'$' => DataOrigin::Immediate,
        b'%' => DataOrigin::Register,
        // Bare addresses, e.g. branch targets.
        b'0'..=b'9' => DataOrigin::Memory,
        _ => DataOrigin::Unknown,
    }
}

fn class_char(class: DataOrigin) -> char {
    match class {
        DataOrigin::Memory => 'm',
        DataOrigin::Register => 'r',
        DataOrigin::Immediate => 'i',
        DataOrigin::Unknown => 'u',
    }
}

fn class_weight(class: DataOrigin) -> u32 {
    match class {
        DataOrigin::Immediate => 1,
        DataOrigin::Register => 2,
        DataOrigin::Memory => 3,
        DataOrigin::Unknown => 0,
    }
}

/// Split an AT&T operand list on commas that sit outside parentheses, so
/// memory references like `0x8(%rax,%rbx,4)` stay in one piece.
fn split_operands(operands: &str) -> Vec<&str> {
    let mut parts = vec![];
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in operands.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&operands[start..idx]);
                start = idx + 1;
            },
            _ => {},
        }
    }
    parts.push(&operands[start..]);
    parts.retain(|p| !p.trim().is_empty());
    parts
}

fn detorigin(code: char) -> DataOrigin {
    match code {
        'r' => DataOrigin::Register,
        'm' => DataOrigin::Memory,
        'i' => DataOrigin::Immediate,
        _ => DataOrigin::Unknown,
    }
}

impl AsmClassifier for X86Classifier {
    fn classify(&self, inst: &str, operands: &str) -> InstructionPair {
        if inst.is_empty() {
            return InstructionPair {
                itype: InstructionType::Unclassified,
                family: InstructionFamily::Other,
                origin: 0,
            };
        }

        let mut chars = operands.chars();
        let origin = match (chars.next(), chars.next()) {
            (Some(o), Some(i)) => pack_origin(detorigin(o), detorigin(i)),
            (Some(single), None) => (detorigin(single) as u8) << ORIGIN_INPUT_SHIFT,
            _ => 0,
        };

        let family = family_lookup(inst, ARITH_OP, BIT_MAN_OP, LOGIC_OP, MEM_OP, JUMP_OP, BRANCH_OP);
        let compute_op = family.is_compute();

        let itype = match inst.chars().next().map(|c| c.to_ascii_lowercase()) {
            Some('v') | Some('p') if compute_op => InstructionType::Vector,
            _ if compute_op => InstructionType::Scalar,
            _ => InstructionType::Unclassified,
        };

        InstructionPair {
            itype,
            family,
            origin,
        }
    }

    fn operand_types(&self, operands: &str) -> String {
        let parts = split_operands(operands);
        if parts.is_empty() {
            return "u".to_string();
        }
        let classes: Vec<DataOrigin> = parts.iter().map(|p| operand_class(p)).collect();
        // AT&T order: destination is the final operand.
        let output = *classes.last().unwrap();
        if classes.len() == 1 {
            return class_char(output).to_string();
        }
        let input = classes[..classes.len() - 1]
            .iter()
            .copied()
            .max_by_key(|c| class_weight(*c))
            .unwrap_or(DataOrigin::Unknown);
        format!("{}{}", class_char(output), class_char(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::origin_string;
    use rstest::rstest;

    #[rstest]
    #[case("vaddpd", "rm", InstructionType::Vector, InstructionFamily::Arithmetic)]
    #[case("addq", "rr", InstructionType::Scalar, InstructionFamily::Arithmetic)]
    #[case("mov", "rr", InstructionType::Scalar, InstructionFamily::Memory)]
    #[case("pxor", "rr", InstructionType::Vector, InstructionFamily::Logic)]
    #[case("vshufps", "rr", InstructionType::Vector, InstructionFamily::Logic)]
    #[case("lea", "rm", InstructionType::Scalar, InstructionFamily::Memory)]
    #[case("jmp", "", InstructionType::Unclassified, InstructionFamily::Jump)]
    #[case("jle", "", InstructionType::Unclassified, InstructionFamily::Branch)]
    #[case("ret", "", InstructionType::Unclassified, InstructionFamily::Other)]
    #[case("nop", "", InstructionType::Unclassified, InstructionFamily::Other)]
    fn classifies_instructions(
        #[case] inst: &str,
        #[case] operands: &str,
        #[case] itype: InstructionType,
        #[case] family: InstructionFamily,
    ) {
        let pair = X86Classifier.classify(inst, operands);
        assert_eq!(pair.itype, itype);
        assert_eq!(pair.family, family);
    }

    #[rstest]
    fn packs_origin_from_operand_code() {
        let pair = X86Classifier.classify("vaddpd", "rm");
        assert_eq!(
            pair.origin,
            pack_origin(DataOrigin::Register, DataOrigin::Memory)
        );
        assert_eq!(origin_string(pair.origin), "mem:reg");

        let pair = X86Classifier.classify("mov", "rr");
        assert_eq!(
            pair.origin,
            pack_origin(DataOrigin::Register, DataOrigin::Register)
        );
    }

    #[rstest]
    // AT&T: `mov %rax,%rbx` writes %rbx from %rax.
    #[case("%rax,%rbx", "rr")]
    // Store: destination is the memory reference.
    #[case("%rax,0x8(%rbx)", "mr")]
    // Load: destination register, source memory.
    #[case("0x8(%rbx,%rcx,4),%xmm0", "rm")]
    #[case("$0x1,%eax", "ri")]
    #[case("%rax", "r")]
    #[case("$0x10", "i")]
    #[case("(%rdi)", "m")]
    #[case("", "u")]
    fn normalises_operands(#[case] operands: &str, #[case] expected: &str) {
        assert_eq!(X86Classifier.operand_types(operands), expected);
    }

    #[rstest]
    fn memory_input_outweighs_register() {
        // Two sources: register and memory; memory wins the input slot.
        assert_eq!(X86Classifier.operand_types("%rax,(%rsi),%rdx"), "rm");
    }

    #[rstest]
    fn empty_instruction_is_unclassified() {
        let pair = X86Classifier.classify("", "");
        assert_eq!(pair.itype, InstructionType::Unclassified);
        assert_eq!(pair.family, InstructionFamily::Other);
        assert_eq!(pair.origin, 0);
    }
}
