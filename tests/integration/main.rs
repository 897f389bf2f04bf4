mod daemon_tests;
mod mock_hw;
mod pid_tests;
mod relay_tests;
mod timer_tests;
