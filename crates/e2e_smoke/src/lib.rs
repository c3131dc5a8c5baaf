//! Smoke tests live under `tests/`; this crate has no library surface.
