use std::time::Instant;

pub struct Timer {
    active: bool,
    start: Option<Instant>,
}

impl Timer {
    pub fn new(active: bool) -> Timer {
        let start = if active { Some(Instant::now()) } else { None };

        Timer { active, start }
    }

    pub fn stop(&self) -> f32 {
        assert!(self.active);

        match self.start {
            Some(start) => in_ms(start.elapsed().as_nanos() as u64),
            None => 0.0,
        }
    }

    pub fn stop_with<F>(&self, f: F) -> u64
    where
        F: FnOnce(f32),
    {
        match self.start {
            Some(start) if self.active => {
                let ns = start.elapsed().as_nanos() as u64;
                f(in_ms(ns));
                ns
            }

            _ => 0,
        }
    }

    pub fn ms<F, R>(active: bool, f: F) -> (f32, R)
    where
        F: FnOnce() -> R,
    {
        if active {
            let start = Instant::now();
            let result = f();
            (in_ms(start.elapsed().as_nanos() as u64), result)
        } else {
            (0.0f32, f())
        }
    }
}

pub fn in_ms(ns: u64) -> f32 {
    (ns as f32) / 1000.0 / 1000.0
}
