use num_complex::Complex;
use rustfft::FftPlanner;

/// move the zero-frequency bin to the center of the array
pub fn fftshift<T>(line:&mut [T]) {
    let n = line.len();
    line.rotate_right(n / 2);
}

pub fn ifftshift<T>(line:&mut [T]) {
    let n = line.len();
    line.rotate_left(n / 2);
}

/// centered forward transform (ifftshift -> fft -> fftshift), unnormalized
pub fn fft_centered(line:&mut Vec<Complex<f32>>) {
    let n = line.len();
    ifftshift(line);
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n);
    fft.process(line);
    fftshift(line);
}

/// centered inverse transform, normalized by 1/n
pub fn ifft_centered(line:&mut Vec<Complex<f32>>) {
    let n = line.len();
    ifftshift(line);
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_inverse(n);
    fft.process(line);
    line.iter_mut().for_each(|c| *c /= n as f32);
    fftshift(line);
}
