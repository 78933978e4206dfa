#[cfg(test)]
mod cache_tests;
#[cfg(test)]
mod mem_tests;
#[cfg(test)]
mod pipeline_tests;
