//! Compiled program cache keyed by [`WmProgKey`].
//!
//! Entries are grouped by program id. Each program keeps at most
//! [`CacheOptions::variants_per_program`] keys, least recently used first out, so a program that
//! keeps changing state does not grow the cache without bound. Evicted programs stay alive for
//! as long as a caller holds their `Arc`.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::{debug, trace};

use crate::compile::{compile_program, CompilationContext, CompileOptions, CompiledProgram};
use crate::error::CompileError;
use crate::key::WmProgKey;
use crate::program::FragmentProgram;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    /// Keys kept per program. A miss beyond this replaces the least recently used variant.
    pub variants_per_program: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            variants_per_program: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Variants dropped to make room for a new key of the same program.
    pub replaced: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookupSource {
    /// The program was already present in the cache.
    Memory,
    /// The compiler ran and the output was inserted into the cache.
    Compiled,
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub source: CacheLookupSource,
    pub program: Arc<CompiledProgram>,
}

impl std::ops::Deref for CacheLookup {
    type Target = CompiledProgram;

    fn deref(&self) -> &Self::Target {
        &self.program
    }
}

pub struct ProgramCache {
    programs: HashMap<u32, LruCache<WmProgKey, Arc<CompiledProgram>>>,
    options: CacheOptions,
    compile_options: CompileOptions,
    stats: CacheStats,
}

impl ProgramCache {
    pub fn new(options: CacheOptions, compile_options: CompileOptions) -> Self {
        Self {
            programs: HashMap::new(),
            options,
            compile_options,
            stats: CacheStats::default(),
        }
    }

    pub fn options(&self) -> CacheOptions {
        self.options
    }

    pub fn compile_options(&self) -> CompileOptions {
        self.compile_options
    }

    /// Changing options that affect code generation drops every entry.
    pub fn set_compile_options(&mut self, compile_options: CompileOptions) {
        if self.compile_options != compile_options {
            self.compile_options = compile_options;
            self.programs.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.programs.values().map(LruCache::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up without compiling, counting or touching recency.
    pub fn peek(&self, program_id: u32, key: &WmProgKey) -> Option<Arc<CompiledProgram>> {
        self.programs.get(&program_id)?.peek(key).cloned()
    }

    pub fn get_or_compile(
        &mut self,
        ctx: &mut CompilationContext,
        program: &FragmentProgram,
        key: &WmProgKey,
    ) -> Result<CacheLookup, CompileError> {
        let id = program.id;
        let hit = self
            .programs
            .get_mut(&id)
            .and_then(|variants| variants.get(key))
            .cloned();
        if let Some(program) = hit {
            self.stats.hits += 1;
            trace!(program = id, "fragment program cache hit");
            return Ok(CacheLookup {
                source: CacheLookupSource::Memory,
                program,
            });
        }

        self.stats.misses += 1;
        let compiled = Arc::new(compile_program(ctx, program, key, &self.compile_options)?);

        let capacity = NonZeroUsize::new(self.options.variants_per_program).unwrap_or(NonZeroUsize::MIN);
        let variants = self
            .programs
            .entry(id)
            .or_insert_with(|| LruCache::new(capacity));
        if let Some((old_key, _)) = variants.push(*key, Arc::clone(&compiled)) {
            if old_key != *key {
                self.stats.replaced += 1;
                debug!(
                    program = id,
                    variants = variants.len(),
                    "replaced cached fragment program variant"
                );
            }
        }

        Ok(CacheLookup {
            source: CacheLookupSource::Compiled,
            program: compiled,
        })
    }

    /// Drops every variant of a program whose source changed. Returns how many were dropped.
    pub fn invalidate_program(&mut self, program_id: u32) -> usize {
        self.programs
            .remove(&program_id)
            .map_or(0, |variants| variants.len())
    }

    pub fn clear(&mut self) {
        self.programs.clear();
    }
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new(CacheOptions::default(), CompileOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;
    use crate::program::{attrib, result, DstReg, Instruction, SrcReg};

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

    fn key(id: u32, height: u32) -> WmProgKey {
        WmProgKey {
            program_string_id: id,
            drawable_height: height,
            ..Default::default()
        }
    }

    #[test]
    fn second_lookup_is_a_hit_sharing_the_same_arc() {
        let mut cache = ProgramCache::default();
        let mut ctx = CompilationContext::new();
        let p = program(1);

        let first = cache.get_or_compile(&mut ctx, &p, &key(1, 480)).unwrap();
        assert_eq!(first.source, CacheLookupSource::Compiled);
        let second = cache.get_or_compile(&mut ctx, &p, &key(1, 480)).unwrap();
        assert_eq!(second.source, CacheLookupSource::Memory);
        assert!(Arc::ptr_eq(&first.program, &second.program));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                replaced: 0
            }
        );
    }

    #[test]
    fn new_key_replaces_the_old_variant_without_invalidating_holders() {
        let mut cache = ProgramCache::default();
        let mut ctx = CompilationContext::new();
        let p = program(1);

        let held = cache.get_or_compile(&mut ctx, &p, &key(1, 480)).unwrap().program;
        cache.get_or_compile(&mut ctx, &p, &key(1, 600)).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().replaced, 1);
        assert!(cache.peek(1, &key(1, 480)).is_none());
        // The evicted program is still intact for whoever holds it.
        assert_eq!(held.key.drawable_height, 480);
        assert!(!held.code.is_empty());
    }

    #[test]
    fn several_variants_can_be_kept() {
        let mut cache = ProgramCache::new(
            CacheOptions {
                variants_per_program: 2,
            },
            CompileOptions::default(),
        );
        let mut ctx = CompilationContext::new();
        let p = program(3);
        cache.get_or_compile(&mut ctx, &p, &key(3, 100)).unwrap();
        cache.get_or_compile(&mut ctx, &p, &key(3, 200)).unwrap();
        let again = cache.get_or_compile(&mut ctx, &p, &key(3, 100)).unwrap();
        assert_eq!(again.source, CacheLookupSource::Memory);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.invalidate_program(3), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn failures_insert_nothing() {
        let mut cache = ProgramCache::new(
            CacheOptions::default(),
            CompileOptions {
                grf_budget: 1,
                ..Default::default()
            },
        );
        let mut ctx = CompilationContext::new();
        assert!(cache.get_or_compile(&mut ctx, &program(1), &key(1, 1)).is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn changing_compile_options_clears_entries() {
        let mut cache = ProgramCache::default();
        let mut ctx = CompilationContext::new();
        cache.get_or_compile(&mut ctx, &program(1), &key(1, 1)).unwrap();
        cache.set_compile_options(CompileOptions {
            allow_spilling: false,
            ..Default::default()
        });
        assert!(cache.is_empty());
    }
}
