use super::{
    family_lookup, pack_origin, AsmClassifier, DataOrigin, InstructionFamily, InstructionPair,
    InstructionType, ORIGIN_INPUT_SHIFT,
};

const ARITH_OP: &[&str] = &[
    "add", "sub", "div", "mul", "mad", "sad", "rem", "abs", "neg", "min", "max", "dp4a", "dp2a",
    "fma", "rcp", "sqrt", "rsqrt", "sin", "cos", "lg2", "ex2", "tanh", ".mma",
];
const BIT_MAN_OP: &[&str] = &[
    "popc", "bfind", "fns", "brev", "bef", "bfi", "szext", "bmsk", "copysign",
];
const LOGIC_OP: &[&str] = &[
    "min", "max", "clz", "testp", "set", "selp", "slct", "and.", "or.", "xor", "not", "cnot",
    "lop3", "shf", "shl", "shr",
];
const MEM_OP: &[&str] = &[
    "mov", "shfl", "prmt", "ld.", "st.", "prefetch", "cvt", "replace", "load", "store",
];
const JUMP_OP: &[&str] = &["call", "ret"];
const BRANCH_OP: &[&str] = &["bra", "brx"];

/// Classifier for NVIDIA PTX instructions (destination operand first).
pub struct PtxClassifier;

fn to_weight(class: char) -> u32 {
    match class {
        'i' => 1,
        'r' => 2,
        'v' => 3,
        'm' => 4,
        _ => 0,
    }
}

fn detorigin(code: char) -> (DataOrigin, bool) {
    match code {
        // Vector operands live in registers.
        'v' => (DataOrigin::Register, true),
        'r' => (DataOrigin::Register, false),
        'm' => (DataOrigin::Memory, false),
        'i' => (DataOrigin::Immediate, false),
        _ => (DataOrigin::Unknown, false),
    }
}

impl AsmClassifier for PtxClassifier {
    fn classify(&self, inst: &str, operands: &str) -> InstructionPair {
        if inst.is_empty() {
            return InstructionPair {
                itype: InstructionType::Unclassified,
                family: InstructionFamily::Other,
                origin: 0,
            };
        }

        let mut is_vector = false;
        let codes: Vec<char> = operands.chars().collect();
        let origin = match codes.len() {
            2 => {
                let (o, vec_o) = detorigin(codes[0]);
                let (i, vec_i) = detorigin(codes[1]);
                is_vector = vec_o || vec_i;
                pack_origin(o, i)
            },
            1 => {
                let (single, vec_s) = detorigin(codes[0]);
                is_vector = vec_s;
                (single as u8) << ORIGIN_INPUT_SHIFT
            },
            _ => 0,
        };

        let family = family_lookup(inst, ARITH_OP, BIT_MAN_OP, LOGIC_OP, MEM_OP, JUMP_OP, BRANCH_OP);
        let compute_op = family.is_compute();

        let mut itype = match inst.chars().next().map(|c| c.to_ascii_lowercase()) {
            Some('v') if compute_op => InstructionType::Vector,
            _ if compute_op => InstructionType::Scalar,
            _ => InstructionType::Unclassified,
        };
        if inst.contains("tensor")
            || inst.contains("wmma")
            || inst.contains("multi")
            || inst.contains(".v")
            || is_vector
        {
            itype = InstructionType::Vector;
        }

        InstructionPair {
            itype,
            family,
            origin,
        }
    }

    /// Scan raw PTX operand text with a bracket-tracking state machine:
    /// `{` opens vector mode, `[` opens memory mode, `%` marks a register
    /// outside bracket modes, any other bare character is immediate. A comma
    /// or semicolon clears the register flag; `}` and `]` close their modes.
    /// The output keeps the first operand's class and the highest-weight
    /// input class (immediate < register < vector < memory).
    fn operand_types(&self, operands: &str) -> String {
        let mut classes = String::new();
        let mut is_vec = false;
        let mut is_mem = false;
        let mut is_reg = false;

        for ch in operands.chars() {
            if ch == '{' {
                is_vec = true;
                classes.push('v');
            } else if ch == '[' {
                is_mem = true;
                classes.push('m');
            } else if !is_vec && !is_mem && ch == '%' {
                is_reg = true;
                classes.push('r');
            } else if !is_vec && !is_mem && !is_reg && (ch == ',' || ch == ';') {
                classes.push('i');
            } else if !is_vec && !is_mem && is_reg && (ch == ',' || ch == ';') {
                is_reg = false;
            } else if ch == '}' || ch == ']' {
                is_vec = false;
                is_mem = false;
            }
        }

        if classes.is_empty() {
            return "u".to_string();
        }

        let mut pair = String::new();
        let mut chars = classes.chars();
        pair.push(chars.next().unwrap());

        let mut weight = 0u32;
        let mut best = 'u';
        for class in chars {
            let w = to_weight(class);
            if weight < w {
                weight = w;
                best = class;
            }
        }
        pair.push(best);
        pair
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("add.s32", InstructionType::Scalar, InstructionFamily::Arithmetic)]
    #[case("fma.rn.f32", InstructionType::Scalar, InstructionFamily::Arithmetic)]
    #[case("wmma.mma.sync", InstructionType::Vector, InstructionFamily::Arithmetic)]
    #[case("ld.global.v4.f32", InstructionType::Vector, InstructionFamily::Memory)]
    #[case("st.shared.f64", InstructionType::Scalar, InstructionFamily::Memory)]
    #[case("and.b32", InstructionType::Scalar, InstructionFamily::Logic)]
    #[case("bra", InstructionType::Unclassified, InstructionFamily::Branch)]
    #[case("call", InstructionType::Unclassified, InstructionFamily::Jump)]
    #[case("bar.sync", InstructionType::Unclassified, InstructionFamily::Other)]
    fn classifies_instructions(
        #[case] inst: &str,
        #[case] itype: InstructionType,
        #[case] family: InstructionFamily,
    ) {
        let pair = PtxClassifier.classify(inst, "");
        assert_eq!(pair.itype, itype, "inst: {}", inst);
        assert_eq!(pair.family, family, "inst: {}", inst);
    }

    #[rstest]
    // dst register, one register input
    #[case("%r1, %r2;", "rr")]
    // dst register, immediate input
    #[case("%r1, 7;", "ri")]
    // dst register, memory input
    #[case("%r1, [%rd4];", "rm")]
    // store: memory dst, register input
    #[case("[%rd4], %r1;", "mr")]
    // vector destination brace group
    #[case("{%r1, %r2}, [%rd8];", "vm")]
    #[case("", "u")]
    fn normalises_operands(#[case] operands: &str, #[case] expected: &str) {
        assert_eq!(PtxClassifier.operand_types(operands), expected);
    }

    #[rstest]
    fn vector_operand_forces_vector_type() {
        let ops = PtxClassifier.operand_types("{%f1, %f2}, %r1;");
        let pair = PtxClassifier.classify("add.f32", &ops);
        assert_eq!(pair.itype, InstructionType::Vector);
        assert_eq!(pair.family, InstructionFamily::Arithmetic);
    }

    #[rstest]
    fn memory_origin_packs_into_input_bits() {
        let pair = PtxClassifier.classify("ld.global.f32", "rm");
        assert_eq!(
            pair.origin,
            pack_origin(DataOrigin::Register, DataOrigin::Memory)
        );
    }
}
