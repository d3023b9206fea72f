pub mod crd;
mod servers;
mod stages;
mod topology;

#[cfg(test)]
mod fixtures;
