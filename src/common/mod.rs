pub mod constants;
pub mod lookup;
pub mod naming;
pub mod projection;

/// Copies admin-enforced fields over tenant defaults, field by field. An
/// enforced field wins only when the tenant left the field unset; tenant
/// values are never overwritten.
#[macro_export]
macro_rules! merge_enforced_fields {
    ($tenant:expr, $enforced:expr, [$($field:ident),+ $(,)?]) => {
        $(
            if $tenant.$field.is_none() && $enforced.$field.is_some() {
                $tenant.$field = $enforced.$field.clone();
            }
        )+
    };
}
