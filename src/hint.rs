cfg_if::cfg_if! {
    // Branch hints consistently shave a few percent off the subtable probe
    // loop, but the intrinsics are nightly-only.
    if #[cfg(feature = "nightly")] {
        #[inline(always)]
        pub(crate) fn likely(b: bool) -> bool {
            unsafe { core::intrinsics::likely(b) }
        }
        #[inline(always)]
        pub(crate) fn unlikely(b: bool) -> bool {
            unsafe { core::intrinsics::unlikely(b) }
        }
    } else {
        #[inline(always)]
        pub(crate) fn likely(b: bool) -> bool {
            b
        }
        #[inline(always)]
        pub(crate) fn unlikely(b: bool) -> bool {
            b
        }
    }
}
