pub mod crd;
mod stages;

#[cfg(test)]
mod fixtures;
