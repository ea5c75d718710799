mod test_version_store;

pub use test_version_store::TestVersionStore;
