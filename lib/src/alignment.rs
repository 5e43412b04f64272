/// Generate `align_down_$suffix` and `align_up_$suffix` for a given integer type.
///
/// Both functions treat `alignment == 0` as a no-op (returns `value` unchanged).
/// `align_up` saturates instead of wrapping past the type's maximum.
macro_rules! impl_align_fns {
    ($ty:ty, $suffix:ident) => {
        paste::paste! {
            /// Align `value` down to a multiple of the power-of-two `alignment`.
            #[inline(always)]
            pub const fn [<align_down_ $suffix>](value: $ty, alignment: $ty) -> $ty {
                if alignment == 0 {
                    return value;
                }
                value & !(alignment - 1)
            }

            /// Align `value` up to a multiple of the power-of-two `alignment`.
            #[inline(always)]
            pub const fn [<align_up_ $suffix>](value: $ty, alignment: $ty) -> $ty {
                if alignment == 0 {
                    return value;
                }
                let adjusted = value.saturating_add(alignment - 1);
                adjusted & !(alignment - 1)
            }

            /// Whether `value` is a multiple of the power-of-two `alignment`.
            #[inline(always)]
            pub const fn [<is_aligned_ $suffix>](value: $ty, alignment: $ty) -> bool {
                alignment == 0 || value & (alignment - 1) == 0
            }
        }
    };
}

impl_align_fns!(u32, u32);
impl_align_fns!(u64, u64);
impl_align_fns!(usize, usize);
