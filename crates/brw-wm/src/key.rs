//! The compilation key: every piece of pipeline state that changes the generated code.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

bitflags! {
    /// Inputs to the depth/stencil ("IZ") payload decision.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IzFlags: u8 {
        /// The program may discard pixels (KIL or alpha test).
        const KILL_ALPHATEST = 1 << 0;
        /// The program writes `result.depth`.
        const COMPUTES_DEPTH = 1 << 1;
        const DEPTH_TEST = 1 << 2;
        const DEPTH_WRITE = 1 << 3;
        const STENCIL_TEST = 1 << 4;
        const STENCIL_WRITE = 1 << 5;
    }
}

/// Whether antialiased line coverage has to be forwarded to the render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AaMode {
    Never = 0,
    Sometimes = 1,
    Always = 2,
}

impl AaMode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => AaMode::Sometimes,
            2 => AaMode::Always,
            _ => AaMode::Never,
        }
    }
}

/// Compilation key for one fragment program variant.
///
/// Plain old data without padding, so two keys are equal exactly when their bytes are.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct WmProgKey {
    pub program_string_id: u32,
    pub origin_x: i32,
    pub origin_y: i32,
    pub drawable_height: u32,
    /// Texture coordinate sets that arrive with a meaningful `q` component.
    pub projtex_mask: u16,
    pub shadowtex_mask: u16,
    pub yuvtex_mask: u16,
    /// YUV units whose chroma channels are stored swapped.
    pub yuvtex_swap_mask: u16,
    /// [`IzFlags`] bits.
    pub iz_lookup: u8,
    /// [`AaMode`] discriminant.
    pub line_aa: u8,
    pub flat_shade: u8,
    /// Color regions bound for rendering; more than one selects per-region writes.
    pub nr_color_regions: u8,
}

const _: () = {
    assert!(std::mem::size_of::<WmProgKey>() == 28);
};

impl WmProgKey {
    pub fn iz_flags(&self) -> IzFlags {
        IzFlags::from_bits_truncate(self.iz_lookup)
    }

    pub fn set_iz_flags(&mut self, flags: IzFlags) {
        self.iz_lookup = flags.bits();
    }

    pub fn line_aa(&self) -> AaMode {
        AaMode::from_raw(self.line_aa)
    }

    pub fn flat_shade(&self) -> bool {
        self.flat_shade != 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn unit_flag(mask: u16, unit: u8) -> bool {
        u32::from(unit) < u16::BITS && mask & (1 << unit) != 0
    }

    pub fn payload_layout(&self) -> PayloadLayout {
        PayloadLayout::new(self.iz_flags(), self.line_aa())
    }
}

/// Registers the hardware delivers ahead of the attribute setup data, and the extra payload the
/// render target write must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLayout {
    /// Interpolated source depth is delivered in the payload.
    pub source_depth: bool,
    /// Antialiasing coverage must be forwarded with each render target write.
    pub aa_dest_stencil: bool,
    /// The render target write carries a depth value.
    pub dest_depth: bool,
    /// That depth value comes from the program rather than the payload.
    pub computes_depth: bool,
}

impl PayloadLayout {
    /// `r0` (thread header) and `r1` (subspan origins).
    pub const HEADER_REGS: u32 = 2;

    pub fn new(iz: IzFlags, line_aa: AaMode) -> Self {
        let computes_depth = iz.contains(IzFlags::COMPUTES_DEPTH);
        let kill = iz.contains(IzFlags::KILL_ALPHATEST);
        let writes = iz.intersects(IzFlags::DEPTH_WRITE | IzFlags::STENCIL_WRITE);
        // Once a pixel may be discarded, early depth/stencil writes are off and the depth value
        // has to travel through the render target write.
        let dest_depth = computes_depth || (kill && writes);
        let source_depth = iz.intersects(IzFlags::DEPTH_TEST | IzFlags::STENCIL_TEST)
            || (dest_depth && !computes_depth);
        Self {
            source_depth,
            aa_dest_stencil: line_aa != AaMode::Never,
            dest_depth,
            computes_depth,
        }
    }

    pub fn source_depth_reg(&self) -> Option<u32> {
        self.source_depth.then_some(Self::HEADER_REGS)
    }

    pub fn aa_dest_stencil_reg(&self) -> Option<u32> {
        self.aa_dest_stencil
            .then_some(Self::HEADER_REGS + u32::from(self.source_depth))
    }

    /// Registers occupied before the constant (CURBE) data.
    pub fn nr_regs(&self) -> u32 {
        Self::HEADER_REGS + u32::from(self.source_depth) + u32::from(self.aa_dest_stencil)
    }
}
