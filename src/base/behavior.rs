/// Every simulation object is ticked exactly once per global cycle and can be reset without
/// losing its port wiring.
pub trait ModuleBehaviors {
    fn tick_one(&mut self);
    fn reset(&mut self);
}
