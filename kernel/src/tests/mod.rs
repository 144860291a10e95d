/*
 * Host Test Suite
 *
 * Tests in this module run on the development host with std. Policy tests
 * use `mock::MockView` in place of the process table; runtime scenarios
 * run the real `Kernel` on `host::HostPlatform`, where every LWP context is
 * an OS thread and a context switch passes a baton between them.
 *
 * ## Modules
 * - `mock` - in-memory `SchedView` for policy tests
 * - `host` - platform, address space and helpers for runtime tests
 * - `lwp_scenarios` - thread create/join/exit/kill and scheduling scenarios,
 *   on one CPU and on two
 * - `sync_scenarios` - semaphore and reader-writer lock scenarios
 */


mod lwp_scenarios;
