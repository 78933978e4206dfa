use std::sync::Arc;

use crate::base::behavior::*;
use crate::timeq::Cycle;

#[derive(Debug)]
pub struct ModuleBase<T, C> {
    pub cycle: Cycle,
    pub state: T,
    pub config: Arc<C>,
}

impl<T, C> ModuleBase<T, C> {
    pub fn new(state: T, config: Arc<C>) -> Self {
        Self {
            cycle: 0,
            state,
            config,
        }
    }

    /// Advance the local clock once the current cycle has been simulated.
    pub fn advance(&mut self) {
        self.cycle += 1;
    }
}

pub trait IsModule: ModuleBehaviors {
    type StateType;
    type ConfigType;

    fn base(&mut self) -> &mut ModuleBase<Self::StateType, Self::ConfigType>;

    fn base_ref(&self) -> &ModuleBase<Self::StateType, Self::ConfigType>;

    fn state_mut(&mut self) -> &mut Self::StateType {
        &mut self.base().state
    }

    fn state(&self) -> &Self::StateType {
        &self.base_ref().state
    }

    fn conf(&self) -> &Self::ConfigType {
        &self.base_ref().config
    }

    /// Cycle currently being simulated by this module.
    fn now(&self) -> Cycle {
        self.base_ref().cycle
    }
}

/// arguments: identifier, state type, config type, additional methods
macro_rules! module {
    ($comp:ident, $T:ty, $C:ty, $($method:item)*) => {
        impl IsModule for $comp {
            type StateType = $T;
            type ConfigType = $C;

            fn base(&mut self) -> &mut ModuleBase<$T, $C> {
                &mut self.base
            }

            fn base_ref(&self) -> &ModuleBase<$T, $C> {
                &self.base
            }

            $($method)*
        }
    };
}

pub(crate) use module;
