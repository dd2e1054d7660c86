use burn::{prelude::*, tensor::backend::Backend};

/// Mean absolute error.
#[derive(Module, Debug)]
pub struct L1Loss<B: Backend> {
    _phantom: std::marker::PhantomData<B>,
}

impl<B: Backend> L1Loss<B> {
    pub const fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn forward<const D: usize>(
        &self,
        input: Tensor<B, D>,
        target: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        (input - target).abs().mean()
    }
}

impl<B: Backend> Default for L1Loss<B> {
    fn default() -> Self {
        Self::new()
    }
}
