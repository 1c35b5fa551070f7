pub(crate) mod backend;
pub(crate) mod client;
pub(crate) mod error;
pub(crate) mod facade;
pub(crate) mod integration;
pub(crate) mod registry;
pub(crate) mod routing;
pub(crate) mod tally;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
