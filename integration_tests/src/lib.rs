//! End-to-end tests for the policy panel workspace live under `tests/`.
