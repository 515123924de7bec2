pub mod gateway;
pub mod htaccess;
pub mod unique;

#[cfg(test)]
mod testutil;
