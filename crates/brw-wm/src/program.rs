//! Machine-independent fragment programs: registers, swizzles and instructions.

use std::fmt;

use bitflags::bitflags;

use crate::error::CompileError;
use crate::limits::{
    FIRST_INTERNAL_TEMP, MAX_DRAW_BUFFERS, MAX_PROGRAM_INSNS, MAX_PROGRAM_TEMPS, MAX_TEX_UNITS,
};
use crate::opcode::Opcode;

/// Fragment input attribute slots.
pub mod attrib {
    pub const WPOS: u16 = 0;
    pub const COL0: u16 = 1;
    pub const COL1: u16 = 2;
    pub const FOGC: u16 = 3;
    pub const TEX0: u16 = 4;
    pub const MAX_TEXCOORD: u16 = 8;
    pub const VAR0: u16 = TEX0 + MAX_TEXCOORD;
    pub const MAX_VARYING: u16 = 8;
    /// Number of attribute slots.
    pub const COUNT: u16 = VAR0 + MAX_VARYING;

    pub const fn tex(unit: u16) -> u16 {
        TEX0 + unit
    }

    /// Texture coordinate set read through attribute `index`, if it is one.
    pub const fn texcoord_unit(index: u16) -> Option<u16> {
        if index >= TEX0 && index < TEX0 + MAX_TEXCOORD {
            Some(index - TEX0)
        } else {
            None
        }
    }
}

/// Fragment output slots.
pub mod result {
    use crate::limits::MAX_DRAW_BUFFERS;

    pub const COLOR: u16 = 0;
    pub const DEPTH: u16 = 1;
    pub const DATA0: u16 = 2;
    pub const COUNT: u16 = DATA0 + MAX_DRAW_BUFFERS as u16;
}

/// Payload register index naming the thread header (`r0`/`r1`) rather than an attribute's setup
/// coefficients.
pub const PAYLOAD_HEADER: u16 = attrib::COUNT;

bitflags! {
    /// Per-component enable bits, used for destination write masks and source negation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ComponentMask: u8 {
        const X = 1 << 0;
        const Y = 1 << 1;
        const Z = 1 << 2;
        const W = 1 << 3;

        const XY = Self::X.bits() | Self::Y.bits();
        const XZ = Self::X.bits() | Self::Z.bits();
        const XW = Self::X.bits() | Self::W.bits();
        const YZ = Self::Y.bits() | Self::Z.bits();
        const ZW = Self::Z.bits() | Self::W.bits();
        const XYZ = Self::X.bits() | Self::Y.bits() | Self::Z.bits();
        const XYZW = Self::XYZ.bits() | Self::W.bits();
    }
}

impl ComponentMask {
    pub const fn component(c: usize) -> Self {
        Self::from_bits_truncate(1 << c)
    }

    pub fn has(self, c: usize) -> bool {
        self.bits() & (1 << c) != 0
    }

    /// Enabled component indices, lowest first.
    pub fn components(self) -> impl Iterator<Item = usize> {
        (0..4).filter(move |&c| self.has(c))
    }
}

impl fmt::Display for ComponentMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (c, name) in ["x", "y", "z", "w"].iter().enumerate() {
            if self.has(c) {
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}

/// Source selector for one swizzle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Swz {
    X,
    Y,
    Z,
    W,
    Zero,
    One,
}

impl Swz {
    pub const fn from_component(c: usize) -> Self {
        match c {
            0 => Swz::X,
            1 => Swz::Y,
            2 => Swz::Z,
            _ => Swz::W,
        }
    }

    /// Register component this selector reads, or `None` for the literal selectors.
    pub const fn component(self) -> Option<usize> {
        match self {
            Swz::X => Some(0),
            Swz::Y => Some(1),
            Swz::Z => Some(2),
            Swz::W => Some(3),
            Swz::Zero | Swz::One => None,
        }
    }

    fn name(self) -> char {
        match self {
            Swz::X => 'x',
            Swz::Y => 'y',
            Swz::Z => 'z',
            Swz::W => 'w',
            Swz::Zero => '0',
            Swz::One => '1',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Swizzle(pub [Swz; 4]);

impl Swizzle {
    pub const XYZW: Swizzle = Swizzle([Swz::X, Swz::Y, Swz::Z, Swz::W]);

    pub const fn new(x: Swz, y: Swz, z: Swz, w: Swz) -> Self {
        Swizzle([x, y, z, w])
    }

    pub const fn splat(s: Swz) -> Self {
        Swizzle([s, s, s, s])
    }

    pub fn get(self, position: usize) -> Swz {
        self.0[position]
    }
}

impl Default for Swizzle {
    fn default() -> Self {
        Swizzle::XYZW
    }
}

impl fmt::Display for Swizzle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in self.0 {
            write!(f, "{}", s.name())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegFile {
    Temporary,
    Input,
    Output,
    /// Parameter-list entry resolved from pipeline state at draw time.
    StateVar,
    /// Parameter-list entry holding a literal vector.
    Constant,
    /// Thread payload delivered by the hardware (header and setup coefficients).
    Payload,
    Undefined,
}

impl RegFile {
    fn name(self) -> &'static str {
        match self {
            RegFile::Temporary => "TEMP",
            RegFile::Input => "INPUT",
            RegFile::Output => "OUTPUT",
            RegFile::StateVar => "STATE",
            RegFile::Constant => "CONST",
            RegFile::Payload => "PAYLOAD",
            RegFile::Undefined => "UNDEF",
        }
    }
}

/// Source operand. `negate` bits apply to swizzle positions, after `abs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SrcReg {
    pub file: RegFile,
    pub index: u16,
    pub swizzle: Swizzle,
    pub negate: ComponentMask,
    pub abs: bool,
}

impl SrcReg {
    pub const fn new(file: RegFile, index: u16) -> Self {
        Self {
            file,
            index,
            swizzle: Swizzle::XYZW,
            negate: ComponentMask::empty(),
            abs: false,
        }
    }

    pub const fn undef() -> Self {
        Self::new(RegFile::Undefined, 0)
    }

    pub fn is_undef(&self) -> bool {
        self.file == RegFile::Undefined
    }

    pub fn temp(index: u16) -> Self {
        Self::new(RegFile::Temporary, index)
    }

    pub fn input(attr: u16) -> Self {
        Self::new(RegFile::Input, attr)
    }

    pub fn output(slot: u16) -> Self {
        Self::new(RegFile::Output, slot)
    }

    pub fn with_swizzle(mut self, swizzle: Swizzle) -> Self {
        self.swizzle = swizzle;
        self
    }

    /// Re-swizzles the operand as seen through its current swizzle: position `i` of the result
    /// reads whatever position `sel[i]` of `self` reads, carrying that position's negation.
    pub fn reswizzle(self, sel: Swizzle) -> Self {
        let mut swizzle = [Swz::Zero; 4];
        let mut negate = ComponentMask::empty();
        for (i, s) in sel.0.iter().enumerate() {
            match s.component() {
                Some(p) => {
                    swizzle[i] = self.swizzle.get(p);
                    if self.negate.has(p) {
                        negate |= ComponentMask::component(i);
                    }
                }
                None => swizzle[i] = *s,
            }
        }
        Self {
            swizzle: Swizzle(swizzle),
            negate,
            ..self
        }
    }

    /// Broadcasts position `s` of the operand to all four positions.
    pub fn splat(self, s: Swz) -> Self {
        self.reswizzle(Swizzle::splat(s))
    }

    pub fn negated(mut self) -> Self {
        self.negate ^= ComponentMask::XYZW;
        self
    }

    pub fn with_negate(mut self, negate: ComponentMask) -> Self {
        self.negate = negate;
        self
    }

    pub fn abs(mut self) -> Self {
        self.abs = true;
        self
    }
}

impl From<DstReg> for SrcReg {
    fn from(dst: DstReg) -> Self {
        SrcReg::new(dst.file, dst.index)
    }
}

impl fmt::Display for SrcReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undef() {
            return f.write_str("_");
        }
        let neg = if self.negate == ComponentMask::XYZW {
            "-"
        } else {
            ""
        };
        let (open, close) = if self.abs { ("|", "|") } else { ("", "") };
        write!(
            f,
            "{neg}{open}{}[{}]{close}.{}",
            self.file.name(),
            self.index,
            self.swizzle
        )?;
        if !self.negate.is_empty() && self.negate != ComponentMask::XYZW {
            write!(f, "(-{})", self.negate)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DstReg {
    pub file: RegFile,
    pub index: u16,
    pub write_mask: ComponentMask,
}

impl DstReg {
    pub const fn new(file: RegFile, index: u16) -> Self {
        Self {
            file,
            index,
            write_mask: ComponentMask::XYZW,
        }
    }

    pub const fn undef() -> Self {
        Self {
            file: RegFile::Undefined,
            index: 0,
            write_mask: ComponentMask::empty(),
        }
    }

    pub fn is_undef(&self) -> bool {
        self.file == RegFile::Undefined
    }

    pub fn temp(index: u16) -> Self {
        Self::new(RegFile::Temporary, index)
    }

    pub fn output(slot: u16) -> Self {
        Self::new(RegFile::Output, slot)
    }

    pub fn masked(mut self, mask: ComponentMask) -> Self {
        self.write_mask = mask;
        self
    }
}

impl fmt::Display for DstReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undef() {
            return f.write_str("_");
        }
        write!(f, "{}[{}].{}", self.file.name(), self.index, self.write_mask)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TexTarget {
    Tex1D,
    Tex2D,
    Tex3D,
    Cube,
    Rect,
}

impl TexTarget {
    /// Coordinate components the sampler consumes.
    pub fn coord_components(self) -> usize {
        match self {
            TexTarget::Tex1D => 1,
            TexTarget::Tex2D | TexTarget::Rect => 2,
            TexTarget::Tex3D | TexTarget::Cube => 3,
        }
    }

    fn name(self) -> &'static str {
        match self {
            TexTarget::Tex1D => "1D",
            TexTarget::Tex2D => "2D",
            TexTarget::Tex3D => "3D",
            TexTarget::Cube => "CUBE",
            TexTarget::Rect => "RECT",
        }
    }
}

impl fmt::Display for TexTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub dst: DstReg,
    pub src: [SrcReg; 3],
    pub saturate: bool,
    /// Program sampler index; mapped to a texture unit through
    /// [`FragmentProgram::sampler_units`].
    pub tex_unit: u8,
    pub tex_target: TexTarget,
}

impl Instruction {
    pub fn new(opcode: Opcode, dst: DstReg, srcs: &[SrcReg]) -> Self {
        let mut src = [SrcReg::undef(); 3];
        for (slot, s) in src.iter_mut().zip(srcs) {
            *slot = *s;
        }
        Self {
            opcode,
            dst,
            src,
            saturate: false,
            tex_unit: 0,
            tex_target: TexTarget::Tex2D,
        }
    }

    pub fn tex(opcode: Opcode, dst: DstReg, coord: SrcReg, sampler: u8, target: TexTarget) -> Self {
        Self {
            tex_unit: sampler,
            tex_target: target,
            ..Self::new(opcode, dst, &[coord])
        }
    }

    pub fn end() -> Self {
        Self::new(Opcode::End, DstReg::undef(), &[])
    }

    pub fn saturated(mut self) -> Self {
        self.saturate = true;
        self
    }
}

/// Symbolic reference to pipeline state, resolved when constants are uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateRef {
    ProgramEnv(u16),
    ProgramLocal(u16),
    /// `(1/width, 1/height, 1, 1)` of the rectangle texture bound to a unit.
    TexRectScale(u8),
    FogColor,
    FogParams,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Parameter {
    State(StateRef),
    Constant([f32; 4]),
}

/// The program's constant pool. Compilation works on a copy, appending entries it needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterList {
    params: Vec<Parameter>,
}

impl ParameterList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, index: u16) -> Option<&Parameter> {
        self.params.get(usize::from(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn push(&mut self, param: Parameter) -> u16 {
        self.params.push(param);
        (self.params.len() - 1) as u16
    }

    pub fn search_or_add_state(&mut self, state: StateRef) -> u16 {
        let found = self
            .params
            .iter()
            .position(|p| matches!(p, Parameter::State(s) if *s == state));
        match found {
            Some(idx) => idx as u16,
            None => self.push(Parameter::State(state)),
        }
    }

    /// Literals compare by bit pattern so repeated compilations find the entry they added before.
    pub fn search_or_add_const4f(&mut self, values: [f32; 4]) -> u16 {
        let bits = values.map(f32::to_bits);
        let found = self
            .params
            .iter()
            .position(|p| matches!(p, Parameter::Constant(v) if v.map(f32::to_bits) == bits));
        match found {
            Some(idx) => idx as u16,
            None => self.push(Parameter::Constant(values)),
        }
    }
}

impl FromIterator<Parameter> for ParameterList {
    fn from_iter<I: IntoIterator<Item = Parameter>>(iter: I) -> Self {
        Self {
            params: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FragmentProgram {
    /// Identity used in the compilation key; a recompiled program text gets a new id.
    pub id: u32,
    pub instructions: Vec<Instruction>,
    pub parameters: ParameterList,
    /// Sampler index to texture unit.
    pub sampler_units: [u8; MAX_TEX_UNITS],
    /// Samplers declared as shadow (depth comparison) samplers.
    pub shadow_samplers: u16,
}

impl FragmentProgram {
    pub fn new(id: u32, instructions: Vec<Instruction>) -> Self {
        let mut sampler_units = [0u8; MAX_TEX_UNITS];
        for (i, unit) in sampler_units.iter_mut().enumerate() {
            *unit = i as u8;
        }
        Self {
            id,
            instructions,
            parameters: ParameterList::new(),
            sampler_units,
            shadow_samplers: 0,
        }
    }

    pub fn with_parameters(mut self, parameters: ParameterList) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn uses_kill(&self) -> bool {
        self.instructions.iter().any(|i| i.opcode == Opcode::Kil)
    }

    /// Bitmask of output slots written by any instruction.
    pub fn outputs_written(&self) -> u32 {
        self.instructions
            .iter()
            .filter(|i| i.dst.file == RegFile::Output && !i.dst.write_mask.is_empty())
            .fold(0, |mask, i| mask | (1 << i.dst.index))
    }

    /// Bitmask of input attributes read by any instruction.
    pub fn inputs_read(&self) -> u32 {
        let mut mask = 0;
        for inst in &self.instructions {
            for src in &inst.src[..inst.opcode.arity()] {
                if src.file == RegFile::Input {
                    mask |= 1 << src.index;
                }
            }
        }
        mask
    }

    pub fn writes_depth(&self) -> bool {
        self.outputs_written() & (1 << result::DEPTH) != 0
    }

    /// Structural checks on register indices, so later passes can index tables without bounds
    /// failures.
    pub fn validate(&self) -> Result<(), CompileError> {
        if self.instructions.len() > MAX_PROGRAM_INSNS {
            return Err(CompileError::InvalidProgram(format!(
                "{} instructions exceeds maximum {MAX_PROGRAM_INSNS}",
                self.instructions.len()
            )));
        }
        for (i, inst) in self.instructions.iter().enumerate() {
            if inst.opcode.is_internal() {
                return Err(CompileError::InvalidProgram(format!(
                    "instruction {i}: {} is reserved for the compiler",
                    inst.opcode
                )));
            }
            check_index(i, inst.dst.file, inst.dst.index, self.parameters.len())?;
            if matches!(
                inst.dst.file,
                RegFile::Input | RegFile::Constant | RegFile::StateVar
            ) {
                return Err(CompileError::InvalidProgram(format!(
                    "instruction {i}: {} registers are read-only",
                    inst.dst.file.name()
                )));
            }
            for src in &inst.src[..inst.opcode.arity()] {
                check_index(i, src.file, src.index, self.parameters.len())?;
            }
            if inst.opcode.is_texture() && usize::from(inst.tex_unit) >= MAX_TEX_UNITS {
                return Err(CompileError::InvalidProgram(format!(
                    "instruction {i}: sampler {} out of range",
                    inst.tex_unit
                )));
            }
            if matches!(inst.opcode, Opcode::Ddx | Opcode::Ddy)
                && inst.src[0].file != RegFile::Input
            {
                return Err(CompileError::InvalidProgram(format!(
                    "instruction {i}: {} of a non-input register is not supported",
                    inst.opcode
                )));
            }
        }
        if let Some(&unit) = self
            .sampler_units
            .iter()
            .find(|&&u| usize::from(u) >= MAX_TEX_UNITS)
        {
            return Err(CompileError::InvalidProgram(format!(
                "sampler mapped to texture unit {unit}"
            )));
        }
        Ok(())
    }
}

fn check_index(insn: usize, file: RegFile, index: u16, nr_params: usize) -> Result<(), CompileError> {
    let limit = match file {
        RegFile::Temporary => MAX_PROGRAM_TEMPS,
        RegFile::Input => attrib::COUNT,
        RegFile::Output => result::COUNT,
        RegFile::StateVar | RegFile::Constant => nr_params as u16,
        RegFile::Undefined => return Ok(()),
        RegFile::Payload => {
            return Err(CompileError::InvalidProgram(format!(
                "instruction {insn}: payload registers are reserved for the compiler"
            )))
        }
    };
    if index >= limit {
        return Err(CompileError::InvalidProgram(format!(
            "instruction {insn}: {} index {index} out of range (limit {limit})",
            file.name()
        )));
    }
    Ok(())
}

const _: () = {
    assert!(FIRST_INTERNAL_TEMP >= MAX_PROGRAM_TEMPS);
    assert!(result::COUNT as u32 <= u32::BITS);
    assert!(attrib::COUNT as u32 <= u32::BITS);
    assert!(MAX_DRAW_BUFFERS as u16 + result::DATA0 == result::COUNT);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reswizzle_composes_with_existing_swizzle() {
        let src = SrcReg::input(attrib::tex(0))
            .with_swizzle(Swizzle::new(Swz::W, Swz::Z, Swz::Y, Swz::X))
            .with_negate(ComponentMask::X);
        let w = src.splat(Swz::X);
        assert_eq!(w.swizzle, Swizzle::splat(Swz::W));
        assert_eq!(w.negate, ComponentMask::XYZW);

        let y = src.splat(Swz::Y);
        assert_eq!(y.swizzle, Swizzle::splat(Swz::Z));
        assert!(y.negate.is_empty());
    }

    #[test]
    fn literal_selectors_survive_reswizzle() {
        let src = SrcReg::temp(3).negated();
        let s = src.reswizzle(Swizzle::new(Swz::One, Swz::Z, Swz::Z, Swz::Z));
        assert_eq!(s.swizzle.get(0), Swz::One);
        assert_eq!(s.negate, ComponentMask::YZ | ComponentMask::W);
    }

    #[test]
    fn constant_pool_deduplicates() {
        let mut params = ParameterList::new();
        let a = params.search_or_add_const4f([1.0, 2.0, 3.0, 4.0]);
        let b = params.search_or_add_state(StateRef::TexRectScale(2));
        assert_eq!(params.search_or_add_const4f([1.0, 2.0, 3.0, 4.0]), a);
        assert_eq!(params.search_or_add_state(StateRef::TexRectScale(2)), b);
        assert_ne!(params.search_or_add_state(StateRef::TexRectScale(3)), b);
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn validate_rejects_out_of_range_registers() {
        let program = FragmentProgram::new(
            1,
            vec![
                Instruction::new(
                    Opcode::Mov,
                    DstReg::temp(MAX_PROGRAM_TEMPS),
                    &[SrcReg::input(attrib::COL0)],
                ),
                Instruction::end(),
            ],
        );
        assert!(matches!(
            program.validate(),
            Err(CompileError::InvalidProgram(_))
        ));
    }

    #[test]
    fn validate_rejects_writes_to_read_only_files() {
        let params: ParameterList = [
            Parameter::State(StateRef::FogColor),
            Parameter::Constant([0.0, 0.5, 1.0, 2.0]),
        ]
        .into_iter()
        .collect();
        let write_to = |dst: DstReg| {
            FragmentProgram::new(
                2,
                vec![
                    Instruction::new(Opcode::Mov, dst, &[SrcReg::temp(0)]),
                    Instruction::new(
                        Opcode::Mov,
                        DstReg::output(result::COLOR),
                        &[SrcReg::input(attrib::tex(0))],
                    ),
                    Instruction::end(),
                ],
            )
            .with_parameters(params.clone())
        };

        for file in [RegFile::Input, RegFile::StateVar, RegFile::Constant] {
            let index = if file == RegFile::Input { attrib::tex(0) } else { 0 };
            assert!(
                matches!(
                    write_to(DstReg::new(file, index)).validate(),
                    Err(CompileError::InvalidProgram(_))
                ),
                "{file:?} destination accepted"
            );
        }
        assert!(write_to(DstReg::temp(1)).validate().is_ok());
    }

    #[test]
    fn display_formats_operands() {
        let src = SrcReg::input(attrib::tex(1)).splat(Swz::W).negated();
        assert_eq!(src.to_string(), "-INPUT[5].wwww");
        let dst = DstReg::output(result::COLOR).masked(ComponentMask::XZ);
        assert_eq!(dst.to_string(), "OUTPUT[0].xz");
    }
}
