//! Pipeline state tracking: derives the compilation key from the bound state and keeps the
//! current program up to date as state changes.

use std::sync::Arc;

use bitflags::bitflags;
use tracing::warn;

use crate::cache::{CacheLookupSource, ProgramCache};
use crate::compile::{CompilationContext, CompiledProgram};
use crate::error::CompileError;
use crate::key::{AaMode, IzFlags, WmProgKey};
use crate::limits::MAX_TEX_UNITS;
use crate::program::{attrib, FragmentProgram};

bitflags! {
    /// State groups changed since the last draw.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DirtyFlags: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
        const POLYGON = 1 << 3;
        const LINE = 1 << 4;
        const LIGHT = 1 << 5;
        const BUFFERS = 1 << 6;
        const TEXTURE = 1 << 7;
        const FRAGMENT_PROGRAM = 1 << 8;
        const INPUT_DIMENSIONS = 1 << 9;
        const REDUCED_PRIMITIVE = 1 << 10;
        /// Vertex-side state the fragment program never depends on.
        const VERTEX_PROGRAM = 1 << 11;
        const VIEWPORT = 1 << 12;
    }
}

impl DirtyFlags {
    /// Everything [`populate_key`] reads.
    pub const WM_PROG: DirtyFlags = DirtyFlags::COLOR
        .union(DirtyFlags::DEPTH)
        .union(DirtyFlags::STENCIL)
        .union(DirtyFlags::POLYGON)
        .union(DirtyFlags::LINE)
        .union(DirtyFlags::LIGHT)
        .union(DirtyFlags::BUFFERS)
        .union(DirtyFlags::TEXTURE)
        .union(DirtyFlags::FRAGMENT_PROGRAM)
        .union(DirtyFlags::INPUT_DIMENSIONS)
        .union(DirtyFlags::REDUCED_PRIMITIVE);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Primitive {
    Points,
    Lines,
    #[default]
    Triangles,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PolygonMode {
    Point,
    Line,
    #[default]
    Fill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullFace {
    Front,
    Back,
    FrontAndBack,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShadeModel {
    #[default]
    Smooth,
    Flat,
}

/// Texel formats that change the generated code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextureFormat {
    #[default]
    Rgba,
    /// Packed YCbCr, chroma in the swapped order.
    Ycbcr,
    /// Packed YCbCr, chroma in the sampler's native order.
    YcbcrRev,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextureUnitState {
    pub enabled: bool,
    pub format: TextureFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drawable {
    pub x: i32,
    pub y: i32,
    pub height: u32,
}

/// Snapshot of the state the fragment program key depends on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineState {
    pub alpha_test: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub stencil_test: bool,
    /// Front and back stencil write masks.
    pub stencil_write_mask: [u32; 2],
    pub stencil_two_side: bool,
    pub line_smooth: bool,
    pub reduced_primitive: Primitive,
    pub polygon_front_mode: PolygonMode,
    pub polygon_back_mode: PolygonMode,
    pub cull_face: Option<CullFace>,
    pub shade_model: ShadeModel,
    pub textures: [TextureUnitState; MAX_TEX_UNITS],
    /// Input attributes the vertex stage delivers with all four components.
    pub input_size4_mask: u32,
    pub drawable: Option<Drawable>,
    pub nr_color_regions: u8,
    /// Viewport transform; tracked for other units, irrelevant to the key.
    pub viewport: [f32; 4],
}

/// Antialiased line coverage is needed whenever lines are rasterized: always for line
/// primitives, and for polygons drawn in line mode depending on which faces survive culling.
pub fn line_aa(state: &PipelineState) -> AaMode {
    if !state.line_smooth {
        return AaMode::Never;
    }
    match state.reduced_primitive {
        Primitive::Lines => AaMode::Always,
        Primitive::Points => AaMode::Never,
        Primitive::Triangles => {
            let front = state.polygon_front_mode == PolygonMode::Line;
            let back = state.polygon_back_mode == PolygonMode::Line;
            if front {
                if back || state.cull_face == Some(CullFace::Back) {
                    AaMode::Always
                } else {
                    AaMode::Sometimes
                }
            } else if back {
                if state.cull_face == Some(CullFace::Front) {
                    AaMode::Always
                } else {
                    AaMode::Sometimes
                }
            } else {
                AaMode::Never
            }
        }
    }
}

pub fn populate_key(state: &PipelineState, program: &FragmentProgram) -> WmProgKey {
    let mut iz = IzFlags::empty();
    if program.uses_kill() || state.alpha_test {
        iz |= IzFlags::KILL_ALPHATEST;
    }
    if program.writes_depth() {
        iz |= IzFlags::COMPUTES_DEPTH;
    }
    if state.depth_test {
        iz |= IzFlags::DEPTH_TEST;
        if state.depth_write {
            iz |= IzFlags::DEPTH_WRITE;
        }
    }
    if state.stencil_test {
        iz |= IzFlags::STENCIL_TEST;
        let [front, back] = state.stencil_write_mask;
        if front != 0 || (state.stencil_two_side && back != 0) {
            iz |= IzFlags::STENCIL_WRITE;
        }
    }

    let mut key = WmProgKey {
        program_string_id: program.id,
        shadowtex_mask: program.shadow_samplers,
        flat_shade: u8::from(state.shade_model == ShadeModel::Flat),
        line_aa: line_aa(state) as u8,
        nr_color_regions: state.nr_color_regions,
        ..Default::default()
    };
    key.set_iz_flags(iz);

    let texcoords = (1u32 << attrib::MAX_TEXCOORD) - 1;
    key.projtex_mask = ((state.input_size4_mask >> attrib::TEX0) & texcoords) as u16;

    for (unit, tex) in state.textures.iter().enumerate() {
        if !tex.enabled {
            continue;
        }
        match tex.format {
            TextureFormat::Ycbcr => {
                key.yuvtex_mask |= 1 << unit;
                key.yuvtex_swap_mask |= 1 << unit;
            }
            TextureFormat::YcbcrRev => key.yuvtex_mask |= 1 << unit,
            TextureFormat::Rgba => {}
        }
    }

    if let Some(drawable) = state.drawable {
        key.origin_x = drawable.x;
        key.origin_y = drawable.y;
        key.drawable_height = drawable.height;
    }
    key
}

/// Keeps the fragment program matching the current pipeline state.
pub struct WmProgState {
    cache: ProgramCache,
    ctx: CompilationContext,
    current: Option<Arc<CompiledProgram>>,
}

impl WmProgState {
    pub fn new(cache: ProgramCache) -> Self {
        Self {
            cache,
            ctx: CompilationContext::new(),
            current: None,
        }
    }

    pub fn current(&self) -> Option<&Arc<CompiledProgram>> {
        self.current.as_ref()
    }

    pub fn cache(&self) -> &ProgramCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ProgramCache {
        &mut self.cache
    }

    /// Brings the current program up to date before a draw.
    ///
    /// Without a tracked dirty flag the current program is reused as is. On failure there is no
    /// current program afterwards, and draws using it must be skipped.
    pub fn prepare(
        &mut self,
        dirty: DirtyFlags,
        state: &PipelineState,
        program: &FragmentProgram,
    ) -> Result<Arc<CompiledProgram>, CompileError> {
        if !dirty.intersects(DirtyFlags::WM_PROG) {
            if let Some(current) = &self.current {
                return Ok(Arc::clone(current));
            }
        }

        let key = populate_key(state, program);
        match self.cache.get_or_compile(&mut self.ctx, program, &key) {
            Ok(lookup) => {
                if lookup.source == CacheLookupSource::Compiled && lookup.prog_data.total_scratch > 0 {
                    warn!(
                        program = program.id,
                        scratch = lookup.prog_data.total_scratch,
                        "fragment program spills to scratch"
                    );
                }
                self.current = Some(Arc::clone(&lookup.program));
                Ok(lookup.program)
            }
            Err(err) => {
                warn!(program = program.id, error = %err, "fragment program compile failed");
                self.current = None;
                Err(err)
            }
        }
    }
}

impl Default for WmProgState {
    fn default() -> Self {
        Self::new(ProgramCache::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;
    use crate::compile::CompileOptions;
    use crate::opcode::Opcode;
    use crate::program::{result, DstReg, Instruction, SrcReg};

    fn program(id: u32) -> FragmentProgram {
        FragmentProgram::new(
            id,
            vec![
                Instruction::new(
                    Opcode::Mov,
                    DstReg::output(result::COLOR),
                    &[SrcReg::input(attrib::COL0)],
                ),
                Instruction::new(Opcode::End, DstReg::undef(), &[]),
            ],
        )
    }

    #[test]
    fn line_aa_follows_polygon_modes() {
        let mut state = PipelineState {
            line_smooth: true,
            ..Default::default()
        };
        assert_eq!(line_aa(&state), AaMode::Never);

        state.polygon_front_mode = PolygonMode::Line;
        assert_eq!(line_aa(&state), AaMode::Sometimes);
        state.cull_face = Some(CullFace::Back);
        assert_eq!(line_aa(&state), AaMode::Always);

        state.polygon_front_mode = PolygonMode::Fill;
        state.polygon_back_mode = PolygonMode::Line;
        assert_eq!(line_aa(&state), AaMode::Sometimes);
        state.cull_face = Some(CullFace::Front);
        assert_eq!(line_aa(&state), AaMode::Always);

        state.reduced_primitive = Primitive::Lines;
        state.line_smooth = false;
        assert_eq!(line_aa(&state), AaMode::Never);
        state.line_smooth = true;
        assert_eq!(line_aa(&state), AaMode::Always);
    }

    #[test]
    fn key_collects_depth_stencil_and_texture_state() {
        let mut state = PipelineState {
            alpha_test: true,
            depth_test: true,
            depth_write: true,
            stencil_test: true,
            stencil_write_mask: [0, 0xff],
            input_size4_mask: 1 << attrib::tex(2),
            drawable: Some(Drawable {
                x: 10,
                y: 20,
                height: 300,
            }),
            ..Default::default()
        };
        state.textures[1] = TextureUnitState {
            enabled: true,
            format: TextureFormat::Ycbcr,
        };
        state.textures[3] = TextureUnitState {
            enabled: true,
            format: TextureFormat::YcbcrRev,
        };
        state.textures[4] = TextureUnitState {
            enabled: false,
            format: TextureFormat::Ycbcr,
        };

        let key = populate_key(&state, &program(9));
        assert_eq!(key.program_string_id, 9);
        assert_eq!(
            key.iz_flags(),
            IzFlags::KILL_ALPHATEST | IzFlags::DEPTH_TEST | IzFlags::DEPTH_WRITE | IzFlags::STENCIL_TEST
        );
        assert_eq!(key.projtex_mask, 1 << 2);
        assert_eq!(key.yuvtex_mask, 0b1010);
        assert_eq!(key.yuvtex_swap_mask, 0b0010);
        assert_eq!((key.origin_x, key.origin_y, key.drawable_height), (10, 20, 300));

        state.stencil_two_side = true;
        let key = populate_key(&state, &program(9));
        assert!(key.iz_flags().contains(IzFlags::STENCIL_WRITE));
    }

    #[test]
    fn clean_state_reuses_the_current_program() {
        let mut wm = WmProgState::default();
        let state = PipelineState::default();
        let p = program(1);
        let first = wm.prepare(DirtyFlags::FRAGMENT_PROGRAM, &state, &p).unwrap();
        let again = wm.prepare(DirtyFlags::VIEWPORT, &state, &p).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(wm.cache().stats().misses, 1);
        assert_eq!(wm.cache().stats().hits, 0);
    }

    #[test]
    fn failed_compile_clears_the_current_program() {
        let cache = ProgramCache::new(
            CacheOptions::default(),
            CompileOptions {
                grf_budget: 1,
                ..Default::default()
            },
        );
        let mut wm = WmProgState::new(cache);
        assert!(wm
            .prepare(DirtyFlags::all(), &PipelineState::default(), &program(1))
            .is_err());
        assert!(wm.current().is_none());

        wm.cache_mut().set_compile_options(CompileOptions::default());
        assert!(wm
            .prepare(DirtyFlags::empty(), &PipelineState::default(), &program(1))
            .is_ok());
        assert!(wm.current().is_some());
    }
}
