use std::sync::Arc;

use pretty_assertions::assert_eq;

use brw_wm::program::{attrib, result, DstReg, RegFile, SrcReg, TexTarget};
use brw_wm::state::{Drawable, ShadeModel, TextureFormat, TextureUnitState};
use brw_wm::{
    populate_key, AaMode, CacheLookupSource, CacheOptions, CompilationContext, CompileError,
    CompileOptions, DirtyFlags, FragmentProgram, Instruction, IzFlags, Opcode, Parameter,
    ParameterList, PipelineState, ProgramCache, ResourceError, StateRef, WmProgKey, WmProgState,
};

fn color_passthrough(id: u32) -> FragmentProgram {
    FragmentProgram::new(
        id,
        vec![
            Instruction::new(
                Opcode::Mov,
                DstReg::output(result::COLOR),
                &[SrcReg::input(attrib::COL0)],
            ),
            Instruction::end(),
        ],
    )
}

fn textured(id: u32) -> FragmentProgram {
    FragmentProgram::new(
        id,
        vec![
            Instruction::tex(
                Opcode::Txp,
                DstReg::output(result::COLOR),
                SrcReg::input(attrib::tex(0)),
                0,
                TexTarget::Tex2D,
            ),
            Instruction::end(),
        ],
    )
}

fn window_position(id: u32) -> FragmentProgram {
    FragmentProgram::new(
        id,
        vec![
            Instruction::new(
                Opcode::Mov,
                DstReg::output(result::COLOR),
                &[SrcReg::input(attrib::WPOS)],
            ),
            Instruction::end(),
        ],
    )
}

fn base_state() -> PipelineState {
    PipelineState {
        drawable: Some(Drawable {
            x: 0,
            y: 0,
            height: 480,
        }),
        nr_color_regions: 1,
        ..Default::default()
    }
}

#[test]
fn state_outside_the_key_reuses_the_current_program() {
    let mut wm = WmProgState::default();
    let program = color_passthrough(1);
    let mut state = base_state();

    let first = wm.prepare(DirtyFlags::all(), &state, &program).unwrap();

    state.viewport = [0.0, 0.0, 640.0, 480.0];
    let second = wm
        .prepare(DirtyFlags::VIEWPORT | DirtyFlags::VERTEX_PROGRAM, &state, &program)
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(wm.cache().stats().misses, 1);
    assert_eq!(wm.cache().stats().hits, 0);
}

#[test]
fn tracked_flags_with_unchanged_state_hit_the_cache() {
    let mut wm = WmProgState::default();
    let program = color_passthrough(1);
    let state = base_state();

    let first = wm.prepare(DirtyFlags::all(), &state, &program).unwrap();
    let second = wm.prepare(DirtyFlags::COLOR, &state, &program).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(wm.cache().stats().hits, 1);
    assert_eq!(wm.cache().len(), 1);
}

#[test]
fn shade_model_changes_the_generated_code() {
    let mut wm = WmProgState::default();
    let program = color_passthrough(2);
    let mut state = base_state();

    let smooth = wm.prepare(DirtyFlags::all(), &state, &program).unwrap();
    state.shade_model = ShadeModel::Flat;
    let flat = wm.prepare(DirtyFlags::LIGHT, &state, &program).unwrap();

    assert!(flat.key.flat_shade());
    assert_ne!(smooth.code, flat.code);
    assert_ne!(smooth.hash, flat.hash);
    assert!(flat.nr_insns() < smooth.nr_insns());
    assert!(Arc::ptr_eq(wm.current().unwrap(), &flat));
}

#[test]
fn drawable_geometry_feeds_window_position() {
    let mut wm = WmProgState::default();
    let program = window_position(3);
    let mut state = base_state();

    let short = wm.prepare(DirtyFlags::BUFFERS, &state, &program).unwrap();
    state.drawable = Some(Drawable {
        x: 16,
        y: 8,
        height: 768,
    });
    let tall = wm.prepare(DirtyFlags::BUFFERS, &state, &program).unwrap();

    assert_eq!(tall.key.drawable_height, 768);
    assert_eq!((tall.key.origin_x, tall.key.origin_y), (16, 8));
    assert_ne!(short.code, tall.code);
}

#[test]
fn texture_state_selects_projective_and_yuv_paths() {
    let program = textured(4);
    let mut state = base_state();
    let affine = populate_key(&state, &program);
    assert_eq!(affine.projtex_mask, 0);
    assert_eq!(affine.yuvtex_mask, 0);

    state.input_size4_mask = 1 << attrib::tex(0) | 1 << attrib::COL0;
    state.textures[0] = TextureUnitState {
        enabled: true,
        format: TextureFormat::Ycbcr,
    };
    state.textures[1] = TextureUnitState {
        enabled: true,
        format: TextureFormat::YcbcrRev,
    };
    // Disabled units never contribute.
    state.textures[2] = TextureUnitState {
        enabled: false,
        format: TextureFormat::Ycbcr,
    };
    let key = populate_key(&state, &program);
    assert_eq!(key.projtex_mask, 0b1);
    assert_eq!(key.yuvtex_mask, 0b11);
    assert_eq!(key.yuvtex_swap_mask, 0b1);

    let mut wm = WmProgState::default();
    let plain = wm
        .prepare(DirtyFlags::TEXTURE, &base_state(), &program)
        .unwrap();
    let converted = wm.prepare(DirtyFlags::TEXTURE, &state, &program).unwrap();
    assert!(converted.nr_insns() > plain.nr_insns());
}

#[test]
fn depth_and_alpha_state_reach_the_key() {
    let program = color_passthrough(5);
    let state = PipelineState {
        alpha_test: true,
        depth_test: true,
        depth_write: true,
        stencil_test: true,
        stencil_write_mask: [0, 0xff],
        ..base_state()
    };
    let key = populate_key(&state, &program);
    assert_eq!(
        key.iz_flags(),
        IzFlags::KILL_ALPHATEST | IzFlags::DEPTH_TEST | IzFlags::DEPTH_WRITE | IzFlags::STENCIL_TEST
    );

    let two_sided = PipelineState {
        stencil_two_side: true,
        ..state.clone()
    };
    assert!(populate_key(&two_sided, &program)
        .iz_flags()
        .contains(IzFlags::STENCIL_WRITE));

    let mut wm = WmProgState::default();
    let compiled = wm.prepare(DirtyFlags::DEPTH, &state, &program).unwrap();
    assert!(compiled.prog_data.uses_kill);
    assert!(!compiled.prog_data.computes_depth);
}

#[test]
fn failed_compiles_leave_no_current_program() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let cache = ProgramCache::new(
        CacheOptions::default(),
        CompileOptions {
            grf_budget: 2,
            ..Default::default()
        },
    );
    let mut wm = WmProgState::new(cache);
    let err = wm
        .prepare(DirtyFlags::all(), &base_state(), &color_passthrough(6))
        .unwrap_err();
    assert!(matches!(
        err,
        CompileError::ResourceExhausted(ResourceError::RegisterBudgetExceeded { .. })
    ));
    assert!(wm.current().is_none());
    assert!(wm.cache().is_empty());

    // A budget that fits recovers on the next draw.
    wm.cache_mut().set_compile_options(CompileOptions::default());
    wm.prepare(DirtyFlags::FRAGMENT_PROGRAM, &base_state(), &color_passthrough(6))
        .unwrap();
    assert!(wm.current().is_some());
}

#[test]
fn pushed_constants_upload_from_current_state() {
    let params: ParameterList = [
        Parameter::State(StateRef::ProgramEnv(2)),
        Parameter::Constant([0.25, 0.5, 0.75, 1.0]),
    ]
    .into_iter()
    .collect();
    let program = FragmentProgram::new(
        7,
        vec![
            Instruction::new(
                Opcode::Mad,
                DstReg::output(result::COLOR),
                &[
                    SrcReg::input(attrib::COL0),
                    SrcReg::new(RegFile::StateVar, 0),
                    SrcReg::new(RegFile::Constant, 1),
                ],
            ),
            Instruction::end(),
        ],
    )
    .with_parameters(params);

    let mut wm = WmProgState::default();
    let compiled = wm
        .prepare(DirtyFlags::all(), &base_state(), &program)
        .unwrap();

    // Literal parameters become immediates; only state is pushed.
    assert_eq!(compiled.constants.indices(), &[0]);
    assert_eq!(
        compiled.prog_data.curb_read_length,
        compiled.constants.read_length()
    );
    assert_eq!(
        compiled.prog_data.first_curbe_grf,
        compiled.key.payload_layout().nr_regs()
    );

    let env = |state: StateRef| match state {
        StateRef::ProgramEnv(2) => [1.0, 2.0, 3.0, 4.0],
        _ => [0.0; 4],
    };
    assert_eq!(
        compiled.constants.upload(&env),
        vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0]
    );
}

#[test]
fn programs_are_cached_independently() {
    let mut wm = WmProgState::default();
    let state = base_state();
    let a = wm
        .prepare(DirtyFlags::FRAGMENT_PROGRAM, &state, &color_passthrough(10))
        .unwrap();
    let b = wm
        .prepare(DirtyFlags::FRAGMENT_PROGRAM, &state, &window_position(11))
        .unwrap();
    assert_ne!(a.hash, b.hash);
    assert_eq!(wm.cache().len(), 2);

    assert_eq!(wm.cache_mut().invalidate_program(10), 1);
    let again = wm
        .prepare(DirtyFlags::FRAGMENT_PROGRAM, &state, &color_passthrough(10))
        .unwrap();
    assert!(!Arc::ptr_eq(&a, &again));
    assert_eq!(a.code, again.code);
}

#[test]
fn every_key_field_selects_its_own_variant() {
    let program = textured(12);
    let base = WmProgKey {
        program_string_id: program.id,
        drawable_height: 480,
        yuvtex_mask: 1,
        nr_color_regions: 1,
        ..Default::default()
    };
    let variants: [(&str, WmProgKey); 4] = [
        (
            "shadowtex_mask",
            WmProgKey {
                shadowtex_mask: 1,
                ..base
            },
        ),
        (
            "yuvtex_swap_mask",
            WmProgKey {
                yuvtex_swap_mask: 1,
                ..base
            },
        ),
        (
            "iz_lookup",
            WmProgKey {
                iz_lookup: (IzFlags::DEPTH_TEST | IzFlags::DEPTH_WRITE).bits(),
                ..base
            },
        ),
        (
            "line_aa",
            WmProgKey {
                line_aa: AaMode::Always as u8,
                ..base
            },
        ),
    ];

    let mut cache = ProgramCache::new(
        CacheOptions {
            variants_per_program: 8,
        },
        CompileOptions::default(),
    );
    let mut ctx = CompilationContext::new();
    let reference = cache.get_or_compile(&mut ctx, &program, &base).unwrap();
    assert_eq!(reference.source, CacheLookupSource::Compiled);

    for (i, (field, key)) in variants.iter().enumerate() {
        let lookup = cache.get_or_compile(&mut ctx, &program, key).unwrap();
        assert_eq!(lookup.source, CacheLookupSource::Compiled, "{field}");
        assert_eq!(cache.stats().misses, i as u64 + 2, "{field}");
        assert_eq!(&lookup.key, key, "{field}");
        assert_ne!(lookup.code, reference.code, "{field}");
    }
    assert_eq!(cache.len(), variants.len() + 1);

    // Each variant is served back from memory with its own code.
    for (field, key) in &variants {
        let again = cache.get_or_compile(&mut ctx, &program, key).unwrap();
        assert_eq!(again.source, CacheLookupSource::Memory, "{field}");
        assert_eq!(&again.key, key, "{field}");
    }
    let base_again = cache.get_or_compile(&mut ctx, &program, &base).unwrap();
    assert!(Arc::ptr_eq(&base_again.program, &reference.program));
}
