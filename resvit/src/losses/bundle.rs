use burn::{prelude::*, tensor::backend::Backend};

use super::{BceLoss, DiceLoss, L1Loss};

/// A loss looked up by its short name.
#[derive(Debug)]
pub enum NamedLoss<'a, B: Backend> {
    Bce(&'a BceLoss<B>),
    Dice(&'a DiceLoss<B>),
    L1(&'a L1Loss<B>),
}

impl<B: Backend> NamedLoss<'_, B> {
    pub fn forward<const D: usize>(
        &self,
        input: Tensor<B, D>,
        target: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        match self {
            Self::Bce(loss) => loss.forward(input, target),
            Self::Dice(loss) => loss.forward(input, target),
            Self::L1(loss) => loss.forward(input, target),
        }
    }
}

/// The detector's losses under their short names: `ls` (pixel BCE), `lb`
/// (Dice region overlap) and `lt` (L1).
///
/// The training objective is `ls + lb`. `lt` is carried so it can be looked
/// up and logged by callers, but it never enters the objective.
#[derive(Module, Debug)]
pub struct LossBundle<B: Backend> {
    pub ls: BceLoss<B>,
    pub lb: DiceLoss<B>,
    pub lt: L1Loss<B>,
}

impl<B: Backend> Default for LossBundle<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> LossBundle<B> {
    pub const NAMES: [&'static str; 3] = ["ls", "lb", "lt"];

    pub fn new() -> Self {
        Self {
            ls: BceLoss::default(),
            lb: DiceLoss::default(),
            lt: L1Loss::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<NamedLoss<'_, B>> {
        match name {
            "ls" => Some(NamedLoss::Bce(&self.ls)),
            "lb" => Some(NamedLoss::Dice(&self.lb)),
            "lt" => Some(NamedLoss::L1(&self.lt)),
            _ => None,
        }
    }

    /// `ls(pred, gt) + lb(pred, gt)`.
    pub fn objective(&self, pred: Tensor<B, 4>, gt: Tensor<B, 4>) -> Tensor<B, 1> {
        self.ls.forward(pred.clone(), gt.clone()) + self.lb.forward(pred, gt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn every_declared_name_resolves() {
        let bundle = LossBundle::<TestBackend>::new();
        for name in LossBundle::<TestBackend>::NAMES {
            assert!(bundle.get(name).is_some(), "missing loss `{name}`");
        }
        assert!(bundle.get("lx").is_none());
    }

    #[test]
    fn objective_is_bce_plus_dice_only() {
        let device = Default::default();
        let bundle = LossBundle::<TestBackend>::new();

        let pred = Tensor::<TestBackend, 4>::from_floats([[[[0.8, 0.3], [0.1, 0.6]]]], &device);
        let gt = Tensor::<TestBackend, 4>::from_floats([[[[1.0, 0.0], [0.0, 1.0]]]], &device);

        let expected = bundle.get("ls").unwrap().forward(pred.clone(), gt.clone()).into_scalar()
            + bundle.get("lb").unwrap().forward(pred.clone(), gt.clone()).into_scalar();
        let objective = bundle.objective(pred, gt).into_scalar();

        assert_relative_eq!(objective, expected, epsilon = 1e-6);
    }
}
