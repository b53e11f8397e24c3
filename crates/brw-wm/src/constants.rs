//! Constant (CURBE) register contents.
//!
//! State parameters a program reads are pushed into registers right after the thread payload,
//! two vec4 parameters per GRF. The compiled program records which parameters were pushed; the
//! driver fills them in at draw time through a [`ParamResolver`].

use crate::limits::GRF_FLOATS;
use crate::program::{Parameter, ParameterList, StateRef};

const PARAM_FLOATS: usize = 4;

/// Current values of the pipeline state a program references.
pub trait ParamResolver {
    fn resolve(&self, state: StateRef) -> [f32; 4];
}

impl<F> ParamResolver for F
where
    F: Fn(StateRef) -> [f32; 4],
{
    fn resolve(&self, state: StateRef) -> [f32; 4] {
        self(state)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantLayout {
    /// Parameter list index of each pushed slot, in register order.
    indices: Vec<u16>,
    entries: Vec<Parameter>,
}

impl ConstantLayout {
    pub fn new(params: &ParameterList, pushed: &[u16]) -> Self {
        let (indices, entries) = pushed
            .iter()
            .filter_map(|&i| params.get(i).map(|p| (i, *p)))
            .unzip();
        Self { indices, entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn indices(&self) -> &[u16] {
        &self.indices
    }

    /// Registers the pushed constants occupy.
    pub fn read_length(&self) -> u32 {
        self.entries.len().div_ceil(GRF_FLOATS / PARAM_FLOATS) as u32
    }

    /// Register contents for the current state, padded to whole registers.
    pub fn upload(&self, resolver: &impl ParamResolver) -> Vec<f32> {
        let mut out = Vec::new();
        self.upload_into(resolver, &mut out);
        out
    }

    pub fn upload_into(&self, resolver: &impl ParamResolver, out: &mut Vec<f32>) {
        out.clear();
        out.reserve(self.read_length() as usize * GRF_FLOATS);
        for param in &self.entries {
            let values = match *param {
                Parameter::State(state) => resolver.resolve(state),
                Parameter::Constant(values) => values,
            };
            out.extend_from_slice(&values);
        }
        out.resize(self.read_length() as usize * GRF_FLOATS, 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_packs_two_parameters_per_register() {
        let params: ParameterList = [
            Parameter::State(StateRef::ProgramEnv(0)),
            Parameter::State(StateRef::FogColor),
            Parameter::State(StateRef::ProgramLocal(3)),
        ]
        .into_iter()
        .collect();
        let layout = ConstantLayout::new(&params, &[1, 2]);
        assert_eq!(layout.indices(), &[1, 2]);
        assert_eq!(layout.read_length(), 1);

        let floats = layout.upload(&|state: StateRef| match state {
            StateRef::FogColor => [0.5, 0.25, 0.125, 1.0],
            _ => [2.0; 4],
        });
        assert_eq!(floats, vec![0.5, 0.25, 0.125, 1.0, 2.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn odd_parameter_counts_are_padded() {
        let params: ParameterList = [Parameter::State(StateRef::TexRectScale(0))]
            .into_iter()
            .collect();
        let layout = ConstantLayout::new(&params, &[0]);
        let floats = layout.upload(&|_: StateRef| [0.01, 0.02, 1.0, 1.0]);
        assert_eq!(floats.len(), GRF_FLOATS);
        assert_eq!(&floats[4..], &[0.0; 4]);
    }

    #[test]
    fn empty_layout_uploads_nothing() {
        let layout = ConstantLayout::default();
        assert!(layout.is_empty());
        assert!(layout.upload(&|_: StateRef| [1.0; 4]).is_empty());
    }
}
