//! Stack-neutral tail calls
//!
//! A function in tail position returns [`Bounce::Call`] with the next step
//! instead of calling it; [`Bounce::run`] drives the chain in a loop, so
//! direct, mutually recursive, conditional and curried tail calls run in
//! constant native stack. A call whose result feeds further computation is
//! an ordinary call and uses the stack as usual.

/// One step of a tail-call chain
pub enum Bounce<T> {
    /// Final result
    Done(T),
    /// Tail call: the next step to run
    Call(Box<dyn FnOnce() -> Bounce<T>>),
}

impl<T> Bounce<T> {
    /// Finish with `value`
    pub fn done(value: T) -> Self {
        Bounce::Done(value)
    }

    /// Tail-call `next`
    pub fn call<F>(next: F) -> Self
    where
        F: FnOnce() -> Bounce<T> + 'static,
    {
        Bounce::Call(Box::new(next))
    }

    /// Drive the chain to its result
    pub fn run(self) -> T {
        let mut current = self;
        loop {
            match current {
                Bounce::Done(value) => return value,
                Bounce::Call(next) => current = next(),
            }
        }
    }
}

/// Run `start` as a trampolined computation
pub fn trampoline<T, F>(start: F) -> T
where
    F: FnOnce() -> Bounce<T>,
{
    start().run()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPTH: u64 = 100_000;

    fn countdown(n: u64) -> Bounce<u64> {
        if n == 0 {
            Bounce::done(0)
        } else {
            Bounce::call(move || countdown(n - 1))
        }
    }

    #[test]
    fn test_direct_self_call() {
        assert_eq!(trampoline(|| countdown(DEPTH)), 0);
    }

    fn is_even(n: u64) -> Bounce<bool> {
        if n == 0 {
            Bounce::done(true)
        } else {
            Bounce::call(move || is_odd(n - 1))
        }
    }

    fn is_odd(n: u64) -> Bounce<bool> {
        if n == 0 {
            Bounce::done(false)
        } else {
            Bounce::call(move || is_even(n - 1))
        }
    }

    #[test]
    fn test_mutual_recursion() {
        assert!(trampoline(|| is_even(DEPTH)));
        assert!(trampoline(|| is_odd(DEPTH + 1)));
    }

    /// Collatz step count; the branch taken decides the next tail call
    fn collatz(n: u64, steps: u64) -> Bounce<u64> {
        if n == 1 {
            Bounce::done(steps)
        } else if n % 2 == 0 {
            Bounce::call(move || collatz(n / 2, steps + 1))
        } else {
            Bounce::call(move || collatz(3 * n + 1, steps + 1))
        }
    }

    #[test]
    fn test_conditional_tail_calls() {
        assert_eq!(trampoline(|| collatz(27, 0)), 111);
    }

    /// `step(n)(acc)` returns a curried function in tail position
    fn curried(n: u64) -> impl FnOnce(u64) -> Bounce<u64> {
        move |acc| {
            if n == 0 {
                Bounce::done(acc)
            } else {
                Bounce::call(move || curried(n - 1)(acc + 1))
            }
        }
    }

    #[test]
    fn test_curried_chain() {
        assert_eq!(trampoline(|| curried(DEPTH)(0)), DEPTH);
    }

    fn factorial_acc(n: u64, acc: u64) -> Bounce<u64> {
        if n <= 1 {
            Bounce::done(acc)
        } else {
            Bounce::call(move || factorial_acc(n - 1, acc * n))
        }
    }

    fn factorial(n: u64) -> u64 {
        // Not a tail call: the result is multiplied afterwards
        if n <= 1 {
            1
        } else {
            n * factorial(n - 1)
        }
    }

    #[test]
    fn test_non_tail_call_is_ordinary() {
        assert_eq!(factorial(10), 3_628_800);
        assert_eq!(trampoline(|| factorial_acc(10, 1)), factorial(10));
    }
}
