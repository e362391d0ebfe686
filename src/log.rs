use std::time::Instant;

// A very minimal profiling thing. Prints to stderr in destructor.
pub struct ProfileScope {
    name: String,
    start: Instant,
    threshold_secs: f64,
}

impl ProfileScope {
    pub fn new(name: String) -> Self {
        ProfileScope {start: Instant::now(), name, threshold_secs: 0.0}
    }

    pub fn with_threshold(secs: f64, name: String) -> Self {
        ProfileScope {start: Instant::now(), name, threshold_secs: secs}
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let secs = self.start.elapsed().as_secs_f64();
        if self.threshold_secs <= 0.0 || secs >= self.threshold_secs {
            eprintln!("info: {} took {:.3}s", self.name, secs);
        }
    }
}
