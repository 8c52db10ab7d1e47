use crate::condition::Condition;

/// Observer of condition registrations.
///
/// Called synchronously after every successful registration. Implementations
/// must not call back into mutating manager methods.
pub trait ConditionsListener: Send + Sync {
    fn on_register_condition(&self, condition: &Condition);
}

impl<F> ConditionsListener for F
where
    F: Fn(&Condition) + Send + Sync,
{
    fn on_register_condition(&self, condition: &Condition) {
        self(condition)
    }
}
